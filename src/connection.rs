//! Radio link lifecycle.
//!
//! [`ConnectionManager`] owns the transport and keeps it connected:
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Reconnecting
//!                                               |
//!                         (retry cap exhausted) v
//!                                          Disconnected
//! any state -> ShuttingDown
//! ```
//!
//! Each open session gets a generation number. Disconnect signals carry
//! the generation they were observed on, so late signals from a replaced
//! session are ignored, and an atomic guard keeps a second signal from
//! starting a second reconnection while one is running.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::{HealthCheckConfig, ReconnectConfig, RelayConfig};
use crate::error::{Error, Result};
use crate::event::{
    ConnectionEvent, ConnectionState, EventDispatcher, EventEmitter, EventFilter,
};
use crate::protocol::{
    FIRMWARE_VERSION_FIELD, MeshPacket, PacketKind, metadata_field, parse_node_info,
};
use crate::queue::{PacketSink, stopped};
use crate::store::{self, NodeStore};
use crate::transport::Transport;
use crate::types::{NodeId, NodeRecord};

/// Consecutive failures after which retry logging turns from warn to error.
const ESCALATE_AFTER: u32 = 5;

/// A freshly opened session whose tasks have not been started yet.
///
/// A reader that fails before then keeps its error in the join handle.
struct Session {
    id: u64,
    reader: JoinHandle<Result<()>>,
    packet_rx: mpsc::Receiver<Bytes>,
}

struct Inner {
    meshnet: String,
    transport: Mutex<Box<dyn Transport>>,
    link_name: String,
    reconnect: ReconnectConfig,
    health: HealthCheckConfig,
    probe_enabled: bool,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    reconnecting: AtomicBool,
    session: AtomicU64,
    next_packet_id: AtomicU32,
    reconnects_scheduled: AtomicU64,
    emitter: EventEmitter,
    dispatcher: EventDispatcher,
    nodes: Arc<dyn NodeStore>,
    session_tasks: parking_lot::Mutex<Vec<AbortHandle>>,
}

/// Keeps one radio link connected and reports what happens on it.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Creates a manager for a transport. Nothing is opened until
    /// [`connect`](Self::connect).
    ///
    /// Whether the health probe runs is decided here: links that report
    /// disconnection themselves never probe.
    #[must_use]
    pub fn new(
        transport: Box<dyn Transport>,
        config: &RelayConfig,
        nodes: Arc<dyn NodeStore>,
    ) -> Self {
        let link_name = transport.name().to_string();
        let probe_enabled = config.health_check.enabled && !transport.reports_disconnect();
        if config.health_check.enabled && !probe_enabled {
            tracing::info!(
                link = %link_name,
                "link reports disconnects itself, health probe disabled"
            );
        }

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                meshnet: config.meshnet_name.clone(),
                transport: Mutex::new(transport),
                link_name,
                reconnect: config.reconnect.clone(),
                health: config.health_check.clone(),
                probe_enabled,
                state_tx,
                shutdown_tx,
                reconnecting: AtomicBool::new(false),
                session: AtomicU64::new(0),
                next_packet_id: AtomicU32::new(1),
                reconnects_scheduled: AtomicU64::new(0),
                emitter: EventEmitter::new(),
                dispatcher: EventDispatcher::new(64),
                nodes,
                session_tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Opens the link, retrying with the reconnection policy.
    ///
    /// # Errors
    ///
    /// `RetriesExhausted` when a retry cap is configured and reached (a
    /// `Fatal` event is emitted too); `ShuttingDown` if shut down meanwhile.
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::ShuttingDown => return Err(Error::ShuttingDown),
            _ => {}
        }
        if !self.inner.try_begin_reconnect() {
            return Err(Error::transport("a connection attempt is already running"));
        }

        self.inner.transition(ConnectionState::Connecting);
        let result = Inner::establish(&self.inner).await;
        self.inner.reconnecting.store(false, Ordering::Release);
        Inner::start_session(&self.inner, result?);
        Ok(())
    }

    /// Sends a packet on the current session and returns its id. Packets
    /// without an id are given the next free one.
    ///
    /// # Errors
    ///
    /// `NotConnected` when the link is not up, or when the write fails (the
    /// failure starts a reconnection).
    pub async fn send(&self, packet: MeshPacket) -> Result<u32> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }

        let session = self.inner.current_session();
        match self.inner.write_packet(packet).await {
            Ok(id) => Ok(id),
            Err(e) => {
                tracing::warn!(link = %self.inner.link_name, "write failed: {}", e);
                self.notify_disconnect("write failure", session);
                Err(Error::NotConnected)
            }
        }
    }

    /// Takes the event receiver. Only the first call gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.inner.emitter.take()
    }

    /// Reports that the link of session `session` looks dead.
    ///
    /// Returns true if this call scheduled a reconnection. Signals from a
    /// replaced session, signals while a reconnection is already running
    /// and signals after shutdown are ignored.
    pub fn notify_disconnect(&self, source: &str, session: u64) -> bool {
        Inner::notify_disconnect(&self.inner, source, session)
    }

    /// Stops everything and closes the transport, waiting at most `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.transition(ConnectionState::ShuttingDown);
        self.inner.shutdown_tx.send_replace(true);
        self.inner.abort_session_tasks();

        let close = async {
            let mut transport = self.inner.transport.lock().await;
            if let Err(e) = transport.close().await {
                tracing::warn!("closing transport: {}", e);
            }
        };
        if tokio::time::timeout(grace, close).await.is_err() {
            tracing::warn!(link = %self.inner.link_name, "transport did not close within {:?}", grace);
        }
        tracing::info!(link = %self.inner.link_name, "connection manager stopped");
    }

    /// Current link state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watches the link state.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Generation number of the current session (0 before the first).
    #[must_use]
    pub fn session(&self) -> u64 {
        self.inner.current_session()
    }

    /// How many reconnections have been scheduled so far.
    #[must_use]
    pub fn reconnects_scheduled(&self) -> u64 {
        self.inner.reconnects_scheduled.load(Ordering::Acquire)
    }

    /// Whether the periodic health probe runs on this link.
    #[must_use]
    pub fn probe_enabled(&self) -> bool {
        self.inner.probe_enabled
    }

    /// Name of the local meshnet.
    #[must_use]
    pub fn meshnet(&self) -> &str {
        &self.inner.meshnet
    }

    /// Sends one health probe now.
    ///
    /// # Errors
    ///
    /// `HealthCheckTimeout` if the request cannot be written or answered
    /// with the firmware version in time, or the write error if the request
    /// could not be sent.
    pub async fn probe(&self) -> Result<()> {
        self.inner.probe().await
    }
}

impl PacketSink for ConnectionManager {
    fn send(&self, packet: MeshPacket) -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>> {
        Box::pin(ConnectionManager::send(self, packet))
    }

    fn wait_ready(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let mut state = self.inner.state_tx.subscribe();
        Box::pin(async move {
            let _ = state
                .wait_for(|s| *s == ConnectionState::Connected)
                .await;
        })
    }
}

impl Inner {
    fn current_session(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }

    fn try_begin_reconnect(&self) -> bool {
        self.reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `to` and emits one event. Returns false if nothing changed.
    ///
    /// `ShuttingDown` is never left.
    fn transition(&self, to: ConnectionState) -> bool {
        let mut from = None;
        self.state_tx.send_if_modified(|state| {
            if *state == to || *state == ConnectionState::ShuttingDown {
                return false;
            }
            from = Some(*state);
            *state = to;
            true
        });

        match from {
            Some(from) => {
                tracing::info!(link = %self.link_name, %from, %to, "link state changed");
                self.emitter.emit(ConnectionEvent::StateChanged { from, to });
                true
            }
            None => false,
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn abort_session_tasks(&self) {
        for task in self.session_tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn write_packet(&self, mut packet: MeshPacket) -> Result<u32> {
        if packet.id == 0 {
            packet.id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        }
        let data = packet.encode();
        tracing::trace!(packet = %hex::encode(&data), "sending packet");
        self.transport.lock().await.write(data).await?;
        Ok(packet.id)
    }

    fn notify_disconnect(this: &Arc<Self>, source: &str, session: u64) -> bool {
        if session != this.current_session() {
            tracing::debug!(source, session, "ignoring disconnect from a replaced session");
            return false;
        }
        if this.is_shutting_down() {
            return false;
        }
        if *this.state_tx.borrow() != ConnectionState::Connected {
            tracing::debug!(source, "ignoring disconnect, link is not up");
            return false;
        }
        if !this.try_begin_reconnect() {
            tracing::debug!(source, "reconnection already in progress");
            return false;
        }

        tracing::warn!(link = %this.link_name, source, "link lost, reconnecting");
        this.reconnects_scheduled.fetch_add(1, Ordering::AcqRel);
        this.transition(ConnectionState::Reconnecting);

        let inner = Arc::clone(this);
        tokio::spawn(async move {
            let result = Self::establish(&inner).await;
            inner.reconnecting.store(false, Ordering::Release);
            match result {
                Ok(session) => Self::start_session(&inner, session),
                Err(e) => tracing::debug!("reconnection ended: {}", e),
            }
        });
        true
    }

    /// Retries opening a session until it works, the cap is reached, or
    /// shutdown is requested. The caller holds the reconnect guard and
    /// starts the session after releasing it.
    async fn establish(this: &Arc<Self>) -> Result<Session> {
        let mut shutdown = this.shutdown_tx.subscribe();
        let mut attempt = 0u32;

        loop {
            if this.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }
            attempt += 1;

            let error = match Self::open_session(this).await {
                Ok(session) => {
                    if attempt > 1 {
                        tracing::info!(link = %this.link_name, attempt, session = session.id, "link re-established");
                    }
                    this.transition(ConnectionState::Connected);
                    return Ok(session);
                }
                Err(e) => e,
            };

            if this.reconnect.max_attempts.is_some_and(|max| attempt >= max) {
                tracing::error!(
                    link = %this.link_name,
                    attempts = attempt,
                    "giving up on the radio link: {}",
                    error
                );
                this.transition(ConnectionState::Disconnected);
                this.emitter.emit(ConnectionEvent::Fatal { attempts: attempt });
                return Err(Error::RetriesExhausted { attempts: attempt });
            }

            let delay = this.reconnect.backoff(attempt);
            if attempt >= ESCALATE_AFTER {
                tracing::error!(link = %this.link_name, attempt, "connection failed, retrying in {:?}: {}", delay, error);
            } else {
                tracing::warn!(link = %this.link_name, attempt, "connection failed, retrying in {:?}: {}", delay, error);
            }

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = stopped(&mut shutdown) => return Err(Error::ShuttingDown),
            }
        }
    }

    /// Replaces whatever session exists with a fresh one.
    async fn open_session(this: &Arc<Self>) -> Result<Session> {
        this.abort_session_tasks();

        let (packet_tx, packet_rx) = mpsc::channel::<Bytes>(256);
        let reader = {
            let mut transport = this.transport.lock().await;
            if let Err(e) = transport.close().await {
                tracing::debug!("closing previous session: {}", e);
            }
            transport.open().await?;
            match transport.start_reader(packet_tx) {
                Ok(reader) => reader,
                Err(e) => {
                    let _ = transport.close().await;
                    return Err(e);
                }
            }
        };

        let id = this.session.fetch_add(1, Ordering::AcqRel) + 1;
        this.session_tasks.lock().push(reader.abort_handle());
        tracing::debug!(link = %this.link_name, session = id, "session opened");

        Ok(Session {
            id,
            reader,
            packet_rx,
        })
    }

    /// Starts the reader watcher, the packet processor and, when enabled,
    /// the health probe for a session.
    fn start_session(this: &Arc<Self>, session: Session) {
        if this.is_shutting_down() {
            session.reader.abort();
            return;
        }
        let Session {
            id,
            reader,
            packet_rx,
        } = session;

        let inner = Arc::clone(this);
        let watcher = tokio::spawn(async move {
            let reason = match reader.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(e) if e.is_cancelled() => return,
                Err(e) => format!("reader task failed: {e}"),
            };
            tracing::warn!(session = id, "radio reader stopped: {}", reason);
            Self::notify_disconnect(&inner, "reader", id);
        });

        let processor = tokio::spawn(Self::process_packets(Arc::clone(this), packet_rx));

        let mut tasks = this.session_tasks.lock();
        tasks.push(watcher.abort_handle());
        tasks.push(processor.abort_handle());
        if this.probe_enabled {
            let health = tokio::spawn(Self::health_loop(Arc::clone(this), id));
            tasks.push(health.abort_handle());
        }
    }

    async fn process_packets(this: Arc<Self>, mut packet_rx: mpsc::Receiver<Bytes>) {
        while let Some(frame) = packet_rx.recv().await {
            this.handle_frame(&frame);
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        let packet = match MeshPacket::parse(frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("dropping packet: {}", e);
                return;
            }
        };
        tracing::trace!(
            id = packet.id,
            from = %packet.from,
            kind = ?packet.kind,
            channel = packet.channel,
            "received packet"
        );

        if packet.from != NodeId::UNKNOWN {
            store::touch(self.nodes.as_ref(), packet.from, &self.meshnet);
        }

        match packet.kind {
            PacketKind::Metadata => {
                self.dispatcher.dispatch(packet);
                return;
            }
            PacketKind::NodeInfo => match parse_node_info(&packet.payload) {
                Ok((long, short)) => {
                    tracing::debug!(node = %packet.from, long = %long, short = %short, "node info");
                    self.nodes.upsert(
                        NodeRecord::seen_now(packet.from, self.meshnet.as_str())
                            .with_names(long, short),
                    );
                }
                Err(e) => tracing::warn!(node = %packet.from, "bad node info: {}", e),
            },
            _ => {}
        }

        self.emitter.emit(ConnectionEvent::Packet(Box::new(packet)));
    }

    async fn health_loop(this: Arc<Self>, session: u64) {
        let mut shutdown = this.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                () = tokio::time::sleep(this.health.interval) => {}
                () = stopped(&mut shutdown) => return,
            }
            if session != this.current_session() {
                return;
            }

            match this.probe().await {
                Ok(()) => tracing::debug!(session, "health check passed"),
                Err(e) => {
                    tracing::warn!(link = %this.link_name, session, "health check failed: {}", e);
                    Self::notify_disconnect(&this, "health check", session);
                    return;
                }
            }
        }
    }

    /// The timeout covers the write as well as the answer; a stuck write
    /// counts as a silent radio.
    async fn probe(&self) -> Result<()> {
        let exchange = async {
            let mut responses = self.dispatcher.subscribe();
            self.write_packet(MeshPacket::metadata_request()).await?;
            let filter = EventFilter::kinds(vec![PacketKind::Metadata]);
            Ok::<_, Error>(responses.wait_for(&filter, self.health.timeout).await)
        };

        match tokio::time::timeout(self.health.timeout, exchange).await {
            Ok(Ok(Some(packet)))
                if metadata_field(&packet.payload, FIRMWARE_VERSION_FIELD).is_some() =>
            {
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            _ => Err(Error::HealthCheckTimeout {
                timeout_ms: u64::try_from(self.health.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}
