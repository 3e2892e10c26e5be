//! # meshrelay
//!
//! A relay between mesh radio networks and federated chat rooms.
//!
//! Packets heard on a radio channel are posted to the chat rooms mapped to
//! that channel, and messages posted in those rooms are sent out on the
//! radio, rate limited to what the firmware tolerates.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Serial, TCP and (with the `ble` feature) Bluetooth Low Energy links
//! - Automatic reconnection with exponential backoff and health probing
//! - Priority-ordered, capacity-bounded outbound queue
//! - Configurable message prefixes and loop prevention between meshnets
//! - Optional reaction and reply relaying in both directions
//! - Command handlers (plugins) isolated by per-event timeouts
//!
//! The `test-util` feature exposes `test_support`: a mock radio and
//! recording sinks for testing code built on the relay.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::future::Future;
//! use std::pin::Pin;
//! use std::sync::Arc;
//!
//! use meshrelay::{ChatSink, ConnectionConfig, MeshRelay, RelayConfig, RelayMessage, TcpConfig};
//!
//! struct Stdout;
//!
//! impl ChatSink for Stdout {
//!     fn send_message<'a>(
//!         &'a self,
//!         message: &'a RelayMessage,
//!     ) -> Pin<Box<dyn Future<Output = meshrelay::Result<Option<String>>> + Send + 'a>> {
//!         Box::pin(async move {
//!             println!("{:?}: {}", message.room(), message.body);
//!             Ok(None)
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), meshrelay::Error> {
//!     let config = RelayConfig::new(
//!         "home",
//!         ConnectionConfig::Tcp(TcpConfig::new("meshtastic.local")),
//!     )
//!     .room("!general:example.org", 0);
//!
//!     let mut relay = MeshRelay::builder(config, Arc::new(Stdout)).build()?;
//!     relay.start().await?;
//!
//!     // Room events from the chat client go in through the sender
//!     let _chat = relay.chat_sender();
//!
//!     relay.wait().await?;
//!     relay.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Stream framing and the mesh packet layout
//! - [`types`] - Node identity and in-flight messages
//! - [`transport`] - Serial, TCP and BLE links
//! - [`connection`] - Link lifecycle, reconnection and health probing
//! - [`queue`] - Rate-limited outbound queue
//! - [`translate`] - Mesh/chat message translation and prefix templates
//! - [`router`] - Event dispatch to the translator and command handlers
//! - [`bridge`] - The assembled [`MeshRelay`]

pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod protocol;
pub mod queue;
pub mod router;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod test_support;
pub mod translate;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use bridge::{MeshRelay, MeshRelayBuilder};
pub use config::{
    HealthCheckConfig, InteractionsConfig, PrefixConfig, QueueConfig, ReconnectConfig,
    RelayConfig, RoomMapping,
};
pub use connection::ConnectionManager;
pub use error::{Error, FrameError, Result};
pub use event::{ConnectionEvent, ConnectionState, EventDispatcher, EventFilter, Subscription};
pub use protocol::{MeshPacket, PacketKind};
pub use queue::{OutboundQueue, PacketSink, Priority, QueueStatus, QueuedMessage};
pub use router::{ChatSink, CommandHandler, EventRouter, RouterEvent};
pub use store::{MemoryMessageMap, MemoryNodeStore, MessageMap, MessageMapEntry, NodeStore};
pub use translate::RelayTranslator;
pub use translate::template::{Template, TemplateMatch};
#[cfg(feature = "ble")]
pub use transport::BleTransport;
pub use transport::{
    BleConfig, ConnectionConfig, SerialConfig, SerialTransport, TcpConfig, TcpTransport,
    Transport, serial::list_ports,
};
pub use types::{
    ChatEvent, ChatEventKind, Direction, NodeId, NodeRecord, OriginTag, Relation, RelayMessage,
    RelayTarget,
};
