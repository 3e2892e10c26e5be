//! Test doubles for the relay's collaborators.
//!
//! [`MockTransport`] stands in for a radio and is driven through its
//! [`MockLink`] handle; the recording sinks capture what the relay emits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::protocol::{MeshPacket, PacketKind};
use crate::queue::PacketSink;
use crate::router::ChatSink;
use crate::transport::{ConnectionConfig, TcpConfig, Transport};
use crate::types::RelayMessage;

/// Metadata the mock radio answers health probes with by default.
pub const DEFAULT_METADATA: &str = "firmware_version=2.5.6;hw_model=TBEAM";

/// Configuration for tests: meshnet `home`, no rooms.
#[must_use]
pub fn relay_config() -> RelayConfig {
    RelayConfig::new("home", ConnectionConfig::Tcp(TcpConfig::new("mock")))
}

enum MockInput {
    Frame(Bytes),
    Drop,
}

struct MockState {
    open: bool,
    opens: u32,
    fail_opens: u32,
    fail_writes: bool,
    stall_writes: watch::Sender<bool>,
    probe_answer: Option<String>,
    written: Vec<MeshPacket>,
    inbound: Option<mpsc::UnboundedSender<MockInput>>,
}

/// In-memory radio.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    reader: Option<mpsc::UnboundedReceiver<MockInput>>,
    reports_disconnect: bool,
}

/// Handle for driving a [`MockTransport`] from a test.
#[derive(Clone)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Creates a mock radio and its control handle.
    #[must_use]
    pub fn new() -> (Self, MockLink) {
        let state = Arc::new(Mutex::new(MockState {
            open: false,
            opens: 0,
            fail_opens: 0,
            fail_writes: false,
            stall_writes: watch::channel(false).0,
            probe_answer: Some(DEFAULT_METADATA.to_string()),
            written: Vec::new(),
            inbound: None,
        }));
        let link = MockLink {
            state: Arc::clone(&state),
        };
        (
            Self {
                state,
                reader: None,
                reports_disconnect: false,
            },
            link,
        )
    }

    /// Makes the mock behave like a link that reports disconnects itself.
    #[must_use]
    pub const fn reporting_disconnect(mut self) -> Self {
        self.reports_disconnect = true;
        self
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn open(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if state.open {
                return Ok(());
            }
            if state.fail_opens > 0 {
                state.fail_opens -= 1;
                return Err(Error::transport("mock radio refused connection"));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.inbound = Some(tx);
            state.open = true;
            state.opens += 1;
            self.reader = Some(rx);
            Ok(())
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.open = false;
            state.inbound = None;
            self.reader = None;
            Ok(())
        })
    }

    fn write(&mut self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut stalled = self.state.lock().stall_writes.subscribe();
            let _ = stalled.wait_for(|stall| !*stall).await;

            let mut state = self.state.lock();
            if !state.open {
                return Err(Error::NotConnected);
            }
            if state.fail_writes {
                return Err(Error::transport("mock write failed"));
            }

            let packet = MeshPacket::parse(&data)?;
            let probe = (packet.kind == PacketKind::MetadataRequest).then_some(packet.id);
            if let (Some(id), Some(answer), Some(inbound)) =
                (probe, &state.probe_answer, &state.inbound)
            {
                let reply = MeshPacket::broadcast(
                    PacketKind::Metadata,
                    0,
                    Bytes::copy_from_slice(answer.as_bytes()),
                )
                .with_id(id);
                let _ = inbound.send(MockInput::Frame(reply.encode()));
            }
            state.written.push(packet);
            Ok(())
        })
    }

    fn start_reader(&mut self, packet_tx: mpsc::Sender<Bytes>) -> Result<JoinHandle<Result<()>>> {
        let mut reader = self.reader.take().ok_or(Error::NotConnected)?;
        Ok(tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Some(MockInput::Frame(frame)) => {
                        if packet_tx.send(frame).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(MockInput::Drop) => return Err(Error::transport("mock link dropped")),
                    None => return Err(Error::transport("mock link closed")),
                }
            }
        }))
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn reports_disconnect(&self) -> bool {
        self.reports_disconnect
    }
}

impl MockLink {
    /// Delivers a packet as if the radio had received it.
    pub fn inject(&self, packet: &MeshPacket) -> bool {
        self.inject_raw(packet.encode())
    }

    /// Delivers raw packet bytes.
    pub fn inject_raw(&self, data: Bytes) -> bool {
        self.state
            .lock()
            .inbound
            .as_ref()
            .is_some_and(|tx| tx.send(MockInput::Frame(data)).is_ok())
    }

    /// Kills the current session's read side.
    pub fn drop_link(&self) {
        if let Some(tx) = &self.state.lock().inbound {
            let _ = tx.send(MockInput::Drop);
        }
    }

    /// Makes the next `count` opens fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.state.lock().fail_opens = count;
    }

    /// Makes writes fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Makes writes hang until reset.
    pub fn set_stall_writes(&self, stall: bool) {
        self.state.lock().stall_writes.send_replace(stall);
    }

    /// Sets the metadata the radio answers probes with; `None` stays silent.
    pub fn answer_probes(&self, answer: Option<&str>) {
        self.state.lock().probe_answer = answer.map(str::to_string);
    }

    /// Every packet written so far, probes included.
    #[must_use]
    pub fn written(&self) -> Vec<MeshPacket> {
        self.state.lock().written.clone()
    }

    /// Written packets that carry text.
    #[must_use]
    pub fn written_text(&self) -> Vec<String> {
        self.state
            .lock()
            .written
            .iter()
            .filter_map(|p| p.text_payload().map(str::to_string))
            .collect()
    }

    /// How many sessions have been opened.
    #[must_use]
    pub fn opens(&self) -> u32 {
        self.state.lock().opens
    }

    /// Whether a session is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

#[derive(Default)]
struct SinkState {
    sent: Vec<(Instant, MeshPacket)>,
    attempts: usize,
    fail_next: usize,
    next_id: u32,
}

/// [`PacketSink`] that records what it is given.
pub struct RecordingPacketSink {
    state: Mutex<SinkState>,
    ready: watch::Sender<bool>,
}

impl RecordingPacketSink {
    /// Creates a ready sink.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (ready, _) = watch::channel(true);
        Arc::new(Self {
            state: Mutex::new(SinkState::default()),
            ready,
        })
    }

    /// Fails the next `count` sends.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Marks the sink ready or not.
    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    /// Successful sends with their times.
    #[must_use]
    pub fn sent(&self) -> Vec<(Instant, MeshPacket)> {
        self.state.lock().sent.clone()
    }

    /// All send calls, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }
}

impl PacketSink for RecordingPacketSink {
    fn send(&self, mut packet: MeshPacket) -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.attempts += 1;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(Error::NotConnected);
            }
            if packet.id == 0 {
                state.next_id += 1;
                packet.id = 0x1000 + state.next_id;
            }
            let id = packet.id;
            state.sent.push((Instant::now(), packet));
            Ok(id)
        })
    }

    fn wait_ready(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let mut ready = self.ready.subscribe();
        Box::pin(async move {
            let _ = ready.wait_for(|r| *r).await;
        })
    }
}

/// [`ChatSink`] that records delivered messages.
///
/// The n-th delivered message (counting from 1) is given the event id `$evn`.
#[derive(Default)]
pub struct RecordingChatSink {
    messages: Mutex<Vec<RelayMessage>>,
    failing_rooms: Mutex<Vec<String>>,
}

impl RecordingChatSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Rejects every message for `room`.
    pub fn fail_room(&self, room: impl Into<String>) {
        self.failing_rooms.lock().push(room.into());
    }

    /// Messages delivered so far.
    #[must_use]
    pub fn messages(&self) -> Vec<RelayMessage> {
        self.messages.lock().clone()
    }
}

impl ChatSink for RecordingChatSink {
    fn send_message<'a>(
        &'a self,
        message: &'a RelayMessage,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move {
            let room = message.room().unwrap_or_default();
            if self.failing_rooms.lock().iter().any(|r| r == room) {
                return Err(Error::Chat {
                    message: format!("room {room} rejected the message"),
                });
            }
            let mut messages = self.messages.lock();
            messages.push(message.clone());
            Ok(Some(format!("$ev{}", messages.len())))
        })
    }
}
