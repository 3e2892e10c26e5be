//! Link events.
//!
//! Two channels leave the connection manager:
//!
//! - [`EventEmitter`] carries [`ConnectionEvent`]s to exactly one consumer
//!   (normally the router). The receiver can be taken once.
//! - [`EventDispatcher`] broadcasts raw packets to any number of short-lived
//!   waiters, such as the health probe waiting for a metadata answer.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::protocol::{MeshPacket, PacketKind};

/// State of the radio link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session. Terminal once a retry cap has been exhausted.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Session open and healthy.
    Connected,
    /// Session lost, retrying with backoff.
    Reconnecting,
    /// Shut down on request. Terminal.
    ShuttingDown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The link changed state. Emitted once per transition.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A packet arrived from the mesh.
    Packet(Box<MeshPacket>),
    /// The retry cap was exhausted; the link will not come back on its own.
    Fatal { attempts: u32 },
}

/// Single-subscriber event channel.
pub struct EventEmitter {
    sender: mpsc::UnboundedSender<ConnectionEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl EventEmitter {
    /// Creates an emitter whose receiver has not been taken yet.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Emits an event. Events are dropped once the subscriber is gone.
    pub fn emit(&self, event: ConnectionEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("event subscriber gone, dropping event");
        }
    }

    /// Takes the receiver. Returns `None` on every call after the first.
    pub fn take(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.receiver.lock().take()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscription to broadcast packets.
pub struct Subscription {
    receiver: broadcast::Receiver<MeshPacket>,
}

impl Subscription {
    /// Receives the next packet, skipping over any the subscriber lagged on.
    pub async fn recv(&mut self) -> Option<MeshPacket> {
        loop {
            match self.receiver.recv().await {
                Ok(packet) => return Some(packet),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Waits for a packet matching the filter.
    ///
    /// Returns `None` if the timeout expires or the channel is closed.
    pub async fn wait_for(&mut self, filter: &EventFilter, timeout: Duration) -> Option<MeshPacket> {
        tokio::select! {
            biased;
            result = async {
                loop {
                    let packet = self.recv().await?;
                    if filter.matches(&packet) {
                        return Some(packet);
                    }
                }
            } => result,
            () = tokio::time::sleep(timeout) => None,
        }
    }
}

/// Filter for broadcast packets.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Accept only these packet kinds.
    pub kinds: Option<Vec<PacketKind>>,
    /// Accept only packets answering this request id.
    pub request_id: Option<u32>,
}

impl EventFilter {
    /// Creates a filter for specific packet kinds.
    #[must_use]
    pub const fn kinds(kinds: Vec<PacketKind>) -> Self {
        Self {
            kinds: Some(kinds),
            request_id: None,
        }
    }

    /// Checks if a packet matches this filter.
    #[must_use]
    pub fn matches(&self, packet: &MeshPacket) -> bool {
        let kind_ok = self
            .kinds
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&packet.kind));
        kind_ok && self.request_id.is_none_or(|id| packet.id == id)
    }
}

/// Broadcasts packets to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<MeshPacket>,
}

impl EventDispatcher {
    /// Creates a new dispatcher.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Sends a packet to all current subscribers.
    pub fn dispatch(&self, packet: MeshPacket) {
        // No subscribers is fine
        let _ = self.sender.send(packet);
    }

    /// Subscribes to packets dispatched from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_receiver_taken_once() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.take().unwrap();
        assert!(emitter.take().is_none());

        emitter.emit(ConnectionEvent::Fatal { attempts: 3 });
        assert_eq!(rx.try_recv().unwrap(), ConnectionEvent::Fatal { attempts: 3 });
    }

    #[test]
    fn test_emit_without_subscriber() {
        let emitter = EventEmitter::new();
        drop(emitter.take());
        emitter.emit(ConnectionEvent::Fatal { attempts: 1 });
    }

    #[tokio::test]
    async fn test_dispatch_to_subscriber() {
        let dispatcher = EventDispatcher::new(16);
        let mut sub = dispatcher.subscribe();

        dispatcher.dispatch(MeshPacket::text(0, "hi"));

        let packet = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.text_payload(), Some("hi"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_skips_non_matching() {
        let dispatcher = EventDispatcher::new(16);
        let mut sub = dispatcher.subscribe();

        dispatcher.dispatch(MeshPacket::text(0, "noise"));
        dispatcher.dispatch(MeshPacket::broadcast(
            PacketKind::Metadata,
            0,
            Bytes::from_static(b"firmware_version=2.5.0"),
        ));

        let filter = EventFilter::kinds(vec![PacketKind::Metadata]);
        let packet = sub.wait_for(&filter, Duration::from_secs(1)).await.unwrap();
        assert_eq!(packet.kind, PacketKind::Metadata);

        assert!(sub.wait_for(&filter, Duration::from_secs(1)).await.is_none());
    }

    #[test]
    fn test_filter_request_id() {
        let filter = EventFilter {
            kinds: None,
            request_id: Some(7),
        };
        assert!(filter.matches(&MeshPacket::text(0, "x").with_id(7)));
        assert!(!filter.matches(&MeshPacket::text(0, "x").with_id(8)));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::ShuttingDown.to_string(), "shutting down");
    }
}
