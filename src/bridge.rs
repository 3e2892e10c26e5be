//! Top-level relay wiring.
//!
//! [`MeshRelay`] assembles the connection manager, the outbound queue, the
//! translator and the router from one [`RelayConfig`], and runs them as
//! three tasks: the link (reader, processor and health probe), the queue
//! consumer and the router.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::queue::{OutboundQueue, PacketSink};
use crate::router::{ChatSink, CommandHandler, EventRouter};
use crate::store::{MemoryMessageMap, MemoryNodeStore, MessageMap, NodeStore};
use crate::translate::RelayTranslator;
use crate::transport::Transport;
use crate::types::ChatEvent;

/// Builder for [`MeshRelay`].
pub struct MeshRelayBuilder {
    config: RelayConfig,
    chat: Arc<dyn ChatSink>,
    transport: Option<Box<dyn Transport>>,
    nodes: Option<Arc<dyn NodeStore>>,
    messages: Option<Arc<dyn MessageMap>>,
    handlers: Vec<Arc<dyn CommandHandler>>,
}

impl MeshRelayBuilder {
    /// Uses this transport instead of building one from the configuration.
    #[must_use]
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Uses this node store instead of an in-memory one.
    #[must_use]
    pub fn node_store(mut self, nodes: Arc<dyn NodeStore>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    /// Uses this message map instead of an in-memory one.
    #[must_use]
    pub fn message_map(mut self, messages: Arc<dyn MessageMap>) -> Self {
        self.messages = Some(messages);
        self
    }

    /// Registers a command handler.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Validates the configuration and assembles the relay.
    pub fn build(self) -> Result<MeshRelay> {
        self.config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => self.config.connection.build()?,
        };
        let nodes = self
            .nodes
            .unwrap_or_else(|| Arc::new(MemoryNodeStore::new()));

        let messages = self.messages.unwrap_or_else(|| {
            Arc::new(MemoryMessageMap::new(self.config.interactions.map_capacity))
        });

        let connection = ConnectionManager::new(transport, &self.config, Arc::clone(&nodes));
        let queue =
            OutboundQueue::with_message_map(self.config.queue.clone(), Arc::clone(&messages));
        let translator = RelayTranslator::new(&self.config, nodes).with_message_map(messages);
        let router = self.handlers.into_iter().fold(
            EventRouter::new(
                translator,
                queue.clone(),
                self.chat,
                self.config.handler_timeout,
            ),
            EventRouter::handler,
        );
        let (stop_tx, _) = watch::channel(false);

        Ok(MeshRelay {
            chat_tx: router.chat_sender(),
            config: self.config,
            connection,
            queue,
            router: Some(router),
            stop_tx,
            consumer: None,
            router_task: None,
        })
    }
}

/// A running (or ready to run) relay between one radio and chat rooms.
pub struct MeshRelay {
    config: RelayConfig,
    connection: ConnectionManager,
    queue: OutboundQueue,
    router: Option<EventRouter>,
    chat_tx: mpsc::Sender<ChatEvent>,
    stop_tx: watch::Sender<bool>,
    consumer: Option<JoinHandle<()>>,
    router_task: Option<JoinHandle<Result<()>>>,
}

impl MeshRelay {
    /// Starts building a relay that posts into `chat`.
    #[must_use]
    pub fn builder(config: RelayConfig, chat: Arc<dyn ChatSink>) -> MeshRelayBuilder {
        MeshRelayBuilder {
            config,
            chat,
            transport: None,
            nodes: None,
            messages: None,
            handlers: Vec::new(),
        }
    }

    /// Connects the radio and starts the queue consumer and the router.
    ///
    /// # Errors
    ///
    /// `RetriesExhausted` if the radio could not be reached within the
    /// retry cap.
    pub async fn start(&mut self) -> Result<()> {
        let Some(router) = self.router.take() else {
            tracing::warn!("relay already started");
            return Ok(());
        };

        tracing::info!(
            meshnet = %self.config.meshnet_name,
            link = self.config.connection.kind(),
            rooms = self.config.rooms.len(),
            "starting relay"
        );
        self.connection.connect().await?;
        let events = self.connection.take_events().ok_or(Error::ChannelClosed)?;

        let queue = self.queue.clone();
        let sink: Arc<dyn PacketSink> = Arc::new(self.connection.clone());
        self.consumer = Some(tokio::spawn(async move { queue.run(sink).await }));
        self.router_task = Some(tokio::spawn(router.run(events, self.stop_tx.subscribe())));
        Ok(())
    }

    /// Sender the chat side delivers room events through.
    #[must_use]
    pub fn chat_sender(&self) -> mpsc::Sender<ChatEvent> {
        self.chat_tx.clone()
    }

    /// The connection manager.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// The outbound queue.
    #[must_use]
    pub const fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Waits until the router stops.
    ///
    /// # Errors
    ///
    /// `RetriesExhausted` when the radio link was lost for good.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.router_task.as_mut() else {
            return Ok(());
        };
        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("router task failed: {}", e);
                Err(Error::ChannelClosed)
            }
        };
        self.router_task = None;
        result
    }

    /// Stops the router, flushes the queue within the shutdown grace and
    /// closes the radio link.
    pub async fn shutdown(mut self) {
        let grace = self.config.shutdown_grace;
        tracing::info!(pending = self.queue.len(), "shutting down relay");

        self.stop_tx.send_replace(true);
        if let Some(task) = self.router_task.take() {
            match task.await {
                Ok(Err(e)) => tracing::warn!("router stopped with error: {}", e),
                Err(e) => tracing::error!("router task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }

        self.queue.close(grace);
        if let Some(consumer) = self.consumer.take() {
            let abort = consumer.abort_handle();
            if tokio::time::timeout(grace + Duration::from_secs(1), consumer)
                .await
                .is_err()
            {
                tracing::warn!("queue consumer did not stop in time");
                abort.abort();
            }
        }

        self.connection.shutdown(grace).await;
        tracing::info!(
            sent = self.queue.status().sent,
            dropped = self.queue.status().dropped,
            "relay stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InteractionsConfig, ReconnectConfig};
    use crate::event::ConnectionState;
    use crate::protocol::{MeshPacket, PacketKind, encode_node_info};
    use crate::queue::{Priority, QueuedMessage};
    use crate::test_support::{MockTransport, RecordingChatSink, relay_config};
    use crate::types::NodeId;

    async fn eventually(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_relays_both_ways() {
        let (transport, link) = MockTransport::new();
        let chat = RecordingChatSink::new();
        let mut relay = MeshRelay::builder(relay_config().room("r1", 0), chat.clone())
            .transport(Box::new(transport))
            .build()
            .unwrap();
        relay.start().await.unwrap();
        assert_eq!(relay.connection().state(), ConnectionState::Connected);

        let announce = MeshPacket {
            from: NodeId::new(5),
            ..MeshPacket::broadcast(PacketKind::NodeInfo, 0, encode_node_info("Hilltop", "HT"))
        };
        link.inject(&announce);
        link.inject(&MeshPacket {
            from: NodeId::new(5),
            ..MeshPacket::text(0, "anyone there?")
        });
        eventually(|| !chat.messages().is_empty()).await;
        assert_eq!(chat.messages()[0].body, "[Hilltop/home]: anyone there?");

        relay
            .chat_sender()
            .send(ChatEvent::text("r1", "@ann:x.org", "Ann", "yes"))
            .await
            .unwrap();
        eventually(|| !link.written_text().is_empty()).await;
        assert_eq!(link.written_text(), ["Ann[M]: yes"]);

        relay.shutdown().await;
        assert!(!link.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactions_relay_both_ways() {
        let (transport, link) = MockTransport::new();
        let chat = RecordingChatSink::new();
        let config = relay_config()
            .room("r1", 0)
            .interactions(InteractionsConfig::new().reactions(true));
        let mut relay = MeshRelay::builder(config, chat.clone())
            .transport(Box::new(transport))
            .build()
            .unwrap();
        relay.start().await.unwrap();

        link.inject(&MeshPacket {
            from: NodeId::new(5),
            ..MeshPacket::text(0, "anyone there?").with_id(0x55)
        });
        eventually(|| chat.messages().len() == 1).await;

        link.inject(&MeshPacket {
            from: NodeId::new(6),
            ..MeshPacket::reaction(0, 0x55, "👍")
        });
        eventually(|| chat.messages().len() == 2).await;
        let reaction = &chat.messages()[1];
        assert!(reaction.emote);
        assert_eq!(reaction.room(), Some("r1"));
        assert!(reaction.body.ends_with("reacted 👍 to \"anyone there?\""));

        // The first delivery became chat event $ev1
        relay
            .chat_sender()
            .send(ChatEvent::reaction("r1", "@ann:x.org", "Ann", "$ev1", "🎉"))
            .await
            .unwrap();
        eventually(|| !link.written_text().is_empty()).await;
        assert_eq!(link.written_text(), ["Ann[M]: reacted 🎉 to \"anyone there?\""]);

        relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_after_retry_cap() {
        let (transport, link) = MockTransport::new();
        link.fail_next_opens(10);
        let config = relay_config()
            .reconnect(ReconnectConfig::new().max_attempts(Some(3)));
        let mut relay = MeshRelay::builder(config, RecordingChatSink::new())
            .transport(Box::new(transport))
            .build()
            .unwrap();

        let result = relay.start().await;
        assert!(matches!(result, Err(Error::RetriesExhausted { attempts: 3 })));
        assert_eq!(relay.connection().state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_within_grace() {
        let (transport, link) = MockTransport::new();
        let mut relay = MeshRelay::builder(relay_config(), RecordingChatSink::new())
            .transport(Box::new(transport))
            .build()
            .unwrap();
        relay.start().await.unwrap();

        for text in ["one", "two"] {
            relay
                .queue()
                .enqueue(QueuedMessage::new(text, 0, "home"), Priority::Normal)
                .unwrap();
        }
        relay.shutdown().await;

        assert_eq!(link.written_text(), ["one", "two"]);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = MeshRelay::builder(relay_config().max_payload_bytes(0), RecordingChatSink::new())
            .transport(Box::new(MockTransport::new().0))
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}
