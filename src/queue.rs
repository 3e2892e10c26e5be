//! Rate-limited outbound queue.
//!
//! Many producers enqueue; one consumer ([`OutboundQueue::run`]) hands
//! messages to a [`PacketSink`] no faster than the configured send delay.
//! Control messages always go before normal ones, FIFO within each tier.
//! A full queue rejects new messages and never evicts queued ones.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

use crate::config::{MAX_PACKET_PAYLOAD, QueueConfig};
use crate::error::{Error, Result};
use crate::protocol::{MeshPacket, PacketKind};
use crate::store::{MessageMap, MessageMapEntry};

/// Dequeue tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Dequeued before anything else.
    Control,
    /// Relayed chat traffic.
    Normal,
}

/// A message waiting to be transmitted.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Text to transmit, already prefixed and truncated.
    pub payload: String,
    /// Target mesh channel.
    pub channel: u8,
    /// Packet kind to transmit as.
    pub kind: PacketKind,
    /// Tier the message was queued in.
    pub priority: Priority,
    /// When the message entered the queue.
    pub enqueued_at: Instant,
    /// Send attempts so far.
    pub attempts: u32,
    /// Meshnet the message originated from.
    pub origin_meshnet: String,
    /// Short description for logs.
    pub description: String,
    /// Mesh packet this message replies to.
    pub reply_id: Option<u32>,
    /// Message map entry to record once sent; its packet id is filled in
    /// from the transmitted packet.
    pub mapping: Option<MessageMapEntry>,
}

impl QueuedMessage {
    /// Creates a text message for a channel.
    #[must_use]
    pub fn new(payload: impl Into<String>, channel: u8, origin_meshnet: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            channel,
            kind: PacketKind::Text,
            priority: Priority::Normal,
            enqueued_at: Instant::now(),
            attempts: 0,
            origin_meshnet: origin_meshnet.into(),
            description: String::new(),
            reply_id: None,
            mapping: None,
        }
    }

    /// Sets the packet kind.
    #[must_use]
    pub const fn kind(mut self, kind: PacketKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the log description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Marks the message as a reply to a mesh packet.
    #[must_use]
    pub const fn reply_to(mut self, packet_id: u32) -> Self {
        self.reply_id = Some(packet_id);
        self
    }

    /// Records the sent packet against a chat event.
    #[must_use]
    pub fn mapping(mut self, entry: MessageMapEntry) -> Self {
        self.mapping = Some(entry);
        self
    }

    /// Builds the packet to transmit.
    #[must_use]
    pub fn to_packet(&self) -> MeshPacket {
        MeshPacket {
            reply_id: self.reply_id,
            ..MeshPacket::broadcast(
                self.kind,
                self.channel,
                Bytes::copy_from_slice(self.payload.as_bytes()),
            )
        }
    }
}

/// Where the consumer delivers messages.
pub trait PacketSink: Send + Sync {
    /// Transmits one packet and returns the id it went out with.
    fn send(&self, packet: MeshPacket) -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>>;

    /// Resolves once the sink can accept packets.
    fn wait_ready(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Snapshot of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    /// Messages waiting.
    pub depth: usize,
    /// Maximum messages.
    pub capacity: usize,
    /// Delay enforced between send attempts.
    pub send_delay: Duration,
    /// Whether a consumer is running.
    pub running: bool,
    /// Whether the queue refuses new messages.
    pub closed: bool,
    /// Time since the last send attempt.
    pub since_last_send: Option<Duration>,
    /// Messages sent successfully.
    pub sent: u64,
    /// Messages dropped after exhausting their attempts or at shutdown.
    pub dropped: u64,
}

#[derive(Default)]
struct QueueState {
    control: VecDeque<QueuedMessage>,
    normal: VecDeque<QueuedMessage>,
    running: bool,
    closed: bool,
    drain_deadline: Option<Instant>,
    last_attempt: Option<Instant>,
    sent: u64,
    dropped: u64,
}

impl QueueState {
    fn len(&self) -> usize {
        self.control.len() + self.normal.len()
    }

    fn tier(&mut self, priority: Priority) -> &mut VecDeque<QueuedMessage> {
        match priority {
            Priority::Control => &mut self.control,
            Priority::Normal => &mut self.normal,
        }
    }

    fn pop(&mut self) -> Option<QueuedMessage> {
        self.control.pop_front().or_else(|| self.normal.pop_front())
    }
}

struct QueueInner {
    config: QueueConfig,
    send_delay: Duration,
    state: Mutex<QueueState>,
    notify: Notify,
    closed_tx: watch::Sender<bool>,
    messages: Option<Arc<dyn MessageMap>>,
}

/// Priority-ordered, capacity-bounded outbound queue.
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<QueueInner>,
}

impl OutboundQueue {
    /// Creates a queue.
    ///
    /// A send delay below the firmware minimum is raised to it.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a queue that records sent messages carrying a mapping.
    #[must_use]
    pub fn with_message_map(config: QueueConfig, messages: Arc<dyn MessageMap>) -> Self {
        Self::build(config, Some(messages))
    }

    fn build(config: QueueConfig, messages: Option<Arc<dyn MessageMap>>) -> Self {
        let send_delay = config.effective_send_delay();
        if send_delay != config.min_send_delay {
            tracing::warn!(
                "send delay {:?} is below the firmware minimum, using {:?}",
                config.min_send_delay,
                send_delay
            );
        }
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                config,
                send_delay,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                closed_tx,
                messages,
            }),
        }
    }

    /// Adds a message and returns the new depth.
    ///
    /// # Errors
    ///
    /// `PayloadTooLarge` when the payload cannot fit in one packet;
    /// `QueueFull` when at capacity (or above the high watermark with
    /// shedding on, for normal messages); `ShuttingDown` after `close`.
    pub fn enqueue(&self, mut message: QueuedMessage, priority: Priority) -> Result<usize> {
        let config = &self.inner.config;
        if message.payload.len() > MAX_PACKET_PAYLOAD {
            tracing::warn!(size = message.payload.len(), "payload exceeds packet size, rejecting message");
            return Err(Error::PayloadTooLarge {
                size: message.payload.len(),
                max: MAX_PACKET_PAYLOAD,
            });
        }
        let depth = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::ShuttingDown);
            }

            let depth = state.len();
            let shed = config.shed_above_high_watermark
                && priority == Priority::Normal
                && depth >= config.high_watermark();
            if depth >= config.capacity || shed {
                tracing::warn!(depth, capacity = config.capacity, "outbound queue full, rejecting message");
                return Err(Error::QueueFull {
                    depth,
                    capacity: config.capacity,
                });
            }

            message.priority = priority;
            message.enqueued_at = Instant::now();
            tracing::debug!(channel = message.channel, "queued {}", message.description);
            state.tier(priority).push_back(message);
            depth + 1
        };

        if depth == config.high_watermark() {
            tracing::warn!(depth, capacity = config.capacity, "outbound queue at high watermark");
        } else if depth == config.medium_watermark() {
            tracing::info!(depth, capacity = config.capacity, "outbound queue at medium watermark");
        }

        self.inner.notify.notify_one();
        Ok(depth)
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of the queue.
    #[must_use]
    pub fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock();
        QueueStatus {
            depth: state.len(),
            capacity: self.inner.config.capacity,
            send_delay: self.inner.send_delay,
            running: state.running,
            closed: state.closed,
            since_last_send: state.last_attempt.map(|at| at.elapsed()),
            sent: state.sent,
            dropped: state.dropped,
        }
    }

    /// Refuses new messages and lets the consumer flush until `grace` has
    /// passed. Whatever is left then is discarded.
    pub fn close(&self, grace: Duration) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.drain_deadline = Some(Instant::now() + grace);
            tracing::info!(pending = state.len(), "closing outbound queue");
        }
        self.inner.closed_tx.send_replace(true);
        self.inner.notify.notify_one();
    }

    /// Runs the consumer until the queue is closed and drained.
    ///
    /// Only one consumer may run; a second call returns immediately.
    pub async fn run(&self, sink: Arc<dyn PacketSink>) {
        {
            let mut state = self.inner.state.lock();
            if state.running {
                tracing::error!("outbound queue consumer already running");
                return;
            }
            state.running = true;
        }
        tracing::debug!(delay = ?self.inner.send_delay, "outbound queue consumer started");

        let mut closed = self.inner.closed_tx.subscribe();

        while let Some(mut message) = self.next_message(&mut closed).await {
            let not_before = self
                .inner
                .state
                .lock()
                .last_attempt
                .map(|at| at + self.inner.send_delay);
            let ready = async {
                sink.wait_ready().await;
                if let Some(at) = not_before {
                    tokio::time::sleep_until(at).await;
                }
            };

            let proceed = match self.drain_deadline() {
                Some(deadline) => tokio::time::timeout_at(deadline, ready).await.is_ok(),
                None => tokio::select! {
                    () = ready => true,
                    () = stopped(&mut closed) => false,
                },
            };
            if !proceed {
                self.requeue(message);
                continue;
            }

            message.attempts += 1;
            self.inner.state.lock().last_attempt = Some(Instant::now());

            match sink.send(message.to_packet()).await {
                Ok(packet_id) => {
                    self.inner.state.lock().sent += 1;
                    tracing::debug!(
                        channel = message.channel,
                        packet_id,
                        waited = ?message.enqueued_at.elapsed(),
                        "sent {}",
                        message.description
                    );
                    if let (Some(messages), Some(mut entry)) =
                        (&self.inner.messages, message.mapping.take())
                    {
                        entry.packet_id = packet_id;
                        messages.record(entry);
                    }
                }
                Err(e) if message.attempts >= self.inner.config.max_attempts => {
                    self.inner.state.lock().dropped += 1;
                    tracing::error!(
                        attempts = message.attempts,
                        "dropping {} after send failures: {}",
                        message.description,
                        e
                    );
                }
                Err(e) => {
                    tracing::warn!(attempt = message.attempts, "send failed, will retry: {}", e);
                    self.requeue(message);
                }
            }
        }

        let mut state = self.inner.state.lock();
        let discarded = state.len();
        if discarded > 0 {
            tracing::warn!(discarded, "shutdown grace expired, discarding queued messages");
            state.dropped += discarded as u64;
            state.control.clear();
            state.normal.clear();
        }
        state.running = false;
    }

    /// Waits for the next message. Returns `None` once closed and either
    /// drained or past the drain deadline.
    async fn next_message(&self, closed: &mut watch::Receiver<bool>) -> Option<QueuedMessage> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    let expired = state.drain_deadline.is_none_or(|d| Instant::now() >= d);
                    if expired || state.len() == 0 {
                        return None;
                    }
                }
                if let Some(message) = state.pop() {
                    return Some(message);
                }
            }

            tokio::select! {
                () = self.inner.notify.notified() => {}
                () = stopped(closed) => {}
            }
        }
    }

    fn requeue(&self, message: QueuedMessage) {
        let mut state = self.inner.state.lock();
        let priority = message.priority;
        state.tier(priority).push_front(message);
    }

    fn drain_deadline(&self) -> Option<Instant> {
        self.inner.state.lock().drain_deadline
    }
}

/// Resolves once the flag is set or its sender is gone.
pub(crate) async fn stopped(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|stop| *stop).await;
}
