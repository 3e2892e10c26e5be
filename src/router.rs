//! Event routing between the link, the chat side and command handlers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::event::ConnectionEvent;
use crate::protocol::MeshPacket;
use crate::queue::{OutboundQueue, stopped};
use crate::translate::RelayTranslator;
use crate::types::{ChatEvent, RelayMessage};

/// Chat events buffered between the chat side and the router.
const CHAT_CHANNEL_CAPACITY: usize = 256;

/// Events waiting for the command handlers.
const HANDLER_BACKLOG: usize = 256;

/// Delivers relayed messages into chat rooms.
pub trait ChatSink: Send + Sync {
    /// Posts a message to the room named by its target.
    ///
    /// Returns the id the chat network gave the posted event, if it has
    /// one. Reactions and replies can only be resolved for messages whose
    /// id was returned.
    fn send_message<'a>(
        &'a self,
        message: &'a RelayMessage,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>>;
}

/// An event as seen by command handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A packet received from the mesh.
    Mesh(MeshPacket),
    /// A message posted in a chat room.
    Chat(ChatEvent),
}

/// A command handler (plugin).
///
/// Handlers see every event after it has been relayed. They run on a
/// separate worker, one at a time and each under a timeout, so a failing
/// or slow handler never holds up relaying.
pub trait CommandHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Command names (without the `!`) this handler answers. Chat messages
    /// invoking them are not relayed to the mesh.
    fn commands(&self) -> Vec<String> {
        Vec::new()
    }

    /// Handles one event.
    fn handle<'a>(
        &'a self,
        event: &'a RouterEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Dispatches link and chat events to the translator and command handlers.
pub struct EventRouter {
    translator: RelayTranslator,
    queue: OutboundQueue,
    chat: Arc<dyn ChatSink>,
    handlers: Vec<Arc<dyn CommandHandler>>,
    handler_timeout: Duration,
    handler_tx: Mutex<Option<mpsc::Sender<RouterEvent>>>,
    chat_tx: mpsc::Sender<ChatEvent>,
    chat_rx: mpsc::Receiver<ChatEvent>,
}

impl EventRouter {
    /// Creates a router with no command handlers.
    #[must_use]
    pub fn new(
        translator: RelayTranslator,
        queue: OutboundQueue,
        chat: Arc<dyn ChatSink>,
        handler_timeout: Duration,
    ) -> Self {
        let (chat_tx, chat_rx) = mpsc::channel(CHAT_CHANNEL_CAPACITY);
        Self {
            translator,
            queue,
            chat,
            handlers: Vec::new(),
            handler_timeout,
            handler_tx: Mutex::new(None),
            chat_tx,
            chat_rx,
        }
    }

    /// Registers a handler. Handlers run in registration order.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.translator = self.translator.with_commands(handler.commands());
        self.handlers.push(handler);
        // A worker started before this call would not know the new handler
        self.handler_tx.get_mut().take();
        self
    }

    /// Returns the sender the chat side delivers room events through.
    #[must_use]
    pub fn chat_sender(&self) -> mpsc::Sender<ChatEvent> {
        self.chat_tx.clone()
    }

    /// The translator in use.
    #[must_use]
    pub const fn translator(&self) -> &RelayTranslator {
        &self.translator
    }

    /// Relays a mesh packet to its rooms, then hands it to the handlers.
    pub async fn dispatch_mesh(&self, packet: MeshPacket) {
        for message in self.translator.mesh_to_chat(&packet) {
            match self.chat.send_message(&message).await {
                Ok(Some(event_id)) => self.translator.record_delivery(&message, event_id),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    room = message.room().unwrap_or_default(),
                    "failed to deliver message to chat: {}",
                    e
                ),
            }
        }
        self.run_handlers(RouterEvent::Mesh(packet));
    }

    /// Queues a chat event for the mesh, then hands it to the handlers.
    pub async fn dispatch_chat(&self, event: ChatEvent) {
        match self.translator.relay_to_mesh(&event, &self.queue) {
            Ok(Some(depth)) => tracing::debug!(depth, "queued chat message"),
            Ok(None) => {}
            Err(e) => tracing::warn!(room = %event.room_id, "dropping chat message: {}", e),
        }
        self.run_handlers(RouterEvent::Chat(event));
    }

    /// Passes an event to the handler worker, starting it on first use.
    fn run_handlers(&self, event: RouterEvent) {
        if self.handlers.is_empty() {
            return;
        }
        let mut handler_tx = self.handler_tx.lock();
        let tx = handler_tx.get_or_insert_with(|| {
            let (tx, rx) = mpsc::channel(HANDLER_BACKLOG);
            tokio::spawn(handler_worker(
                self.handlers.clone(),
                self.handler_timeout,
                rx,
            ));
            tx
        });
        if let Err(e) = tx.try_send(event) {
            tracing::warn!("command handlers backlogged, skipping event: {}", e);
        }
    }

    /// Routes events until shutdown.
    ///
    /// # Errors
    ///
    /// `RetriesExhausted` when the link gave up for good, `ChannelClosed`
    /// when the link's event channel closed.
    pub async fn run(
        mut self,
        mut link_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        tracing::debug!(handlers = self.handlers.len(), "router started");
        loop {
            tokio::select! {
                () = stopped(&mut shutdown) => {
                    tracing::debug!("router stopped");
                    return Ok(());
                }
                event = link_events.recv() => match event {
                    Some(ConnectionEvent::Packet(packet)) => self.dispatch_mesh(*packet).await,
                    Some(ConnectionEvent::StateChanged { from, to }) => {
                        tracing::debug!(%from, %to, "link state changed");
                    }
                    Some(ConnectionEvent::Fatal { attempts }) => {
                        tracing::error!(attempts, "radio link lost for good, stopping router");
                        return Err(Error::RetriesExhausted { attempts });
                    }
                    None => return Err(Error::ChannelClosed),
                },
                Some(event) = self.chat_rx.recv() => self.dispatch_chat(event).await,
            }
        }
    }
}

/// Runs every handler on each event, in registration order.
async fn handler_worker(
    handlers: Vec<Arc<dyn CommandHandler>>,
    timeout: Duration,
    mut events: mpsc::Receiver<RouterEvent>,
) {
    while let Some(event) = events.recv().await {
        let event = Arc::new(event);
        for handler in &handlers {
            let task_handler = Arc::clone(handler);
            let task_event = Arc::clone(&event);
            let task = tokio::spawn(async move { task_handler.handle(&task_event).await });
            let abort = task.abort_handle();

            let reason = match tokio::time::timeout(timeout, task).await {
                Ok(Ok(Ok(()))) => continue,
                Ok(Ok(Err(e))) => e.to_string(),
                Ok(Err(e)) if e.is_panic() => "panicked".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(_) => {
                    abort.abort();
                    format!("timed out after {timeout:?}")
                }
            };
            let error = Error::PluginDispatch {
                handler: handler.name().to_string(),
                reason,
            };
            tracing::warn!("{}", error);
        }
    }
    tracing::debug!("command handler worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, RelayConfig};
    use crate::store::MemoryNodeStore;
    use crate::test_support::{RecordingChatSink, relay_config};
    use crate::types::{NodeId, OriginTag};

    struct Recorder {
        seen: Mutex<Vec<RouterEvent>>,
    }

    impl CommandHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn commands(&self) -> Vec<String> {
            vec!["ping".to_string()]
        }

        fn handle<'a>(
            &'a self,
            event: &'a RouterEvent,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async move {
                self.seen.lock().push(event.clone());
                Ok(())
            })
        }
    }

    enum Misbehaviour {
        Fail,
        Panic,
        Hang,
    }

    struct Broken(Misbehaviour);

    impl CommandHandler for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn handle<'a>(
            &'a self,
            _event: &'a RouterEvent,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async move {
                match self.0 {
                    Misbehaviour::Fail => Err(Error::ChannelClosed),
                    Misbehaviour::Panic => panic!("handler bug"),
                    Misbehaviour::Hang => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(())
                    }
                }
            })
        }
    }

    fn router(config: &RelayConfig) -> (EventRouter, OutboundQueue, Arc<RecordingChatSink>) {
        let queue = OutboundQueue::new(QueueConfig::new());
        let chat = RecordingChatSink::new();
        let translator = RelayTranslator::new(config, Arc::new(MemoryNodeStore::new()));
        let router = EventRouter::new(
            translator,
            queue.clone(),
            chat.clone(),
            config.handler_timeout,
        );
        (router, queue, chat)
    }

    fn packet(channel: u8, text: &str) -> MeshPacket {
        MeshPacket {
            from: NodeId::new(0x10),
            ..MeshPacket::text(channel, text)
        }
    }

    #[tokio::test]
    async fn test_failing_room_does_not_block_others() {
        let config = relay_config().room("r1", 0).room("r2", 0);
        let (router, _, chat) = router(&config);
        chat.fail_room("r1");

        router.dispatch_mesh(packet(0, "hello")).await;

        let delivered = chat.messages();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].room(), Some("r2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_handlers_are_isolated() {
        let config = relay_config().room("r1", 0);
        let (router, _, chat) = router(&config);
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let router = router
            .handler(Arc::new(Broken(Misbehaviour::Fail)))
            .handler(Arc::new(Broken(Misbehaviour::Panic)))
            .handler(Arc::new(Broken(Misbehaviour::Hang)))
            .handler(recorder.clone());

        router.dispatch_mesh(packet(0, "still relayed")).await;
        assert_eq!(chat.messages().len(), 1);

        // The hanging handler holds the worker until its timeout
        tokio::time::sleep(config.handler_timeout + Duration::from_secs(1)).await;
        assert_eq!(
            recorder.seen.lock().as_slice(),
            [RouterEvent::Mesh(packet(0, "still relayed"))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_handler_does_not_delay_relaying() {
        let config = relay_config().room("r1", 0);
        let (router, _, chat) = router(&config);
        let router = router.handler(Arc::new(Broken(Misbehaviour::Hang)));
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(router.run(link_rx, shutdown_rx));

        for text in ["one", "two", "three"] {
            link_tx
                .send(ConnectionEvent::Packet(Box::new(packet(0, text))))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let bodies: Vec<_> = chat.messages().into_iter().map(|m| m.text).collect();
        assert_eq!(bodies, ["one", "two", "three"]);

        shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handler_commands_are_not_relayed() {
        let config = relay_config().room("r1", 0);
        let (router, queue, _) = router(&config);
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let router = router.handler(recorder.clone());

        router
            .dispatch_chat(ChatEvent::text("r1", "@a:x.org", "Ann", "!ping"))
            .await;
        router
            .dispatch_chat(ChatEvent::text("r1", "@a:x.org", "Ann", "hello mesh"))
            .await;

        assert_eq!(queue.len(), 1);
        tokio::time::timeout(Duration::from_secs(1), async {
            while recorder.seen.lock().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_chat_sender_feeds_queue() {
        let config = relay_config().room("r1", 3);
        let (router, queue, _) = router(&config);
        let sender = router.chat_sender();
        let (_link_tx, link_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(router.run(link_rx, shutdown_rx));

        sender
            .send(ChatEvent::text("r1", "@a:x.org", "Ann", "over"))
            .await
            .unwrap();
        sender
            .send(
                ChatEvent::text("r1", "@relay:x.org", "Relay", "[Ridge/home]: echo").with_origin(
                    OriginTag {
                        meshnet: "home".into(),
                        long_name: "Ridge".into(),
                        short_name: None,
                    },
                ),
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while queue.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        tokio::task::yield_now().await;

        shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();
        assert_eq!(queue.len(), 1);
    }

    /// Notes the queue depth at every chat delivery.
    struct DepthAtDelivery {
        queue: OutboundQueue,
        depths: Mutex<Vec<usize>>,
    }

    impl ChatSink for DepthAtDelivery {
        fn send_message<'a>(
            &'a self,
            _message: &'a RelayMessage,
        ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
            Box::pin(async move {
                self.depths.lock().push(self.queue.len());
                Ok(None)
            })
        }
    }

    #[tokio::test]
    async fn test_chat_events_interleave_with_busy_link() {
        let config = relay_config().room("r1", 0);
        let queue = OutboundQueue::new(QueueConfig::new());
        let chat = Arc::new(DepthAtDelivery {
            queue: queue.clone(),
            depths: Mutex::new(Vec::new()),
        });
        let router = EventRouter::new(
            RelayTranslator::new(&config, Arc::new(MemoryNodeStore::new())),
            queue.clone(),
            chat.clone(),
            config.handler_timeout,
        );

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        for i in 0..200 {
            link_tx
                .send(ConnectionEvent::Packet(Box::new(packet(0, &format!("m{i}")))))
                .unwrap();
        }
        router
            .chat_sender()
            .send(ChatEvent::text("r1", "@a:x.org", "Ann", "meanwhile"))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(router.run(link_rx, shutdown_rx));
        tokio::time::timeout(Duration::from_secs(5), async {
            while chat.depths.lock().len() < 200 || queue.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();

        // The chat event was not starved until the link went quiet
        assert!(chat.depths.lock().contains(&1));
    }

    #[tokio::test]
    async fn test_fatal_event_ends_router() {
        let config = relay_config();
        let (router, _, _) = router(&config);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        link_tx.send(ConnectionEvent::Fatal { attempts: 4 }).unwrap();

        let result = router.run(link_rx, shutdown_rx).await;
        assert!(matches!(result, Err(Error::RetriesExhausted { attempts: 4 })));
    }
}
