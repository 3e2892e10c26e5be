//! Messages in flight between the mesh and the chat side.

use crate::types::NodeId;

/// Which way a message is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received on the mesh, going to chat rooms.
    MeshToChat,
    /// Received in a chat room, going to the mesh.
    ChatToMesh,
}

/// Where a relayed message is going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTarget {
    /// A chat room id.
    Room(String),
    /// A mesh channel index.
    Channel(u8),
}

/// Canonical in-flight representation of a relayed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    /// Sender long name (or raw id when unknown).
    pub sender_long: String,
    /// Sender short name (or raw id when unknown).
    pub sender_short: String,
    /// Meshnet the message originated from.
    pub meshnet: String,
    /// Formatted body, prefix included.
    pub body: String,
    /// Unformatted text as received.
    pub text: String,
    /// Travel direction.
    pub direction: Direction,
    /// Destination.
    pub target: RelayTarget,
    /// Originating mesh packet id, when there is one.
    pub packet_id: Option<u32>,
    /// Originating mesh node, when there is one.
    pub sender_node: Option<NodeId>,
    /// Whether the payload came from a detection sensor.
    pub detection_sensor: bool,
    /// Chat event this message replies to.
    pub reply_to: Option<String>,
    /// Post as an emote (used for reactions).
    pub emote: bool,
}

impl RelayMessage {
    /// Returns the target room, if this message is going to chat.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        match &self.target {
            RelayTarget::Room(room) => Some(room),
            RelayTarget::Channel(_) => None,
        }
    }
}

/// Origin metadata a chat event carries when it was itself relayed from a
/// meshnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginTag {
    /// Meshnet the message came from.
    pub meshnet: String,
    /// Original sender long name.
    pub long_name: String,
    /// Original sender short name, if known.
    pub short_name: Option<String>,
}

/// Kind of chat-side payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatEventKind {
    /// Ordinary text.
    #[default]
    Text,
    /// Detection sensor data relayed through chat from another meshnet.
    DetectionSensor,
}

/// How a chat event relates to an earlier one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    /// An annotation (emoji reaction) on another event.
    Reaction {
        /// The event reacted to.
        target: String,
        /// The reaction key, usually a single emoji.
        key: String,
    },
    /// A reply quoting another event.
    Reply {
        /// The event replied to.
        target: String,
    },
}

impl Relation {
    /// The related event id.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::Reaction { target, .. } | Self::Reply { target } => target,
        }
    }
}

/// A message observed in a chat room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    /// Room the message was posted in.
    pub room_id: String,
    /// Chat-network user id (for example `@alice:example.org`).
    pub sender_id: String,
    /// Room display name of the sender.
    pub sender_display: String,
    /// Message body.
    pub body: String,
    /// Present when the message is a relay from some meshnet.
    pub origin: Option<OriginTag>,
    /// Payload kind.
    pub kind: ChatEventKind,
    /// The chat network's id for this event, when known.
    pub event_id: Option<String>,
    /// Reaction or reply relationship, if any.
    pub relation: Option<Relation>,
}

impl ChatEvent {
    /// Creates a plain text event from a chat user.
    #[must_use]
    pub fn text(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_display: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            sender_display: sender_display.into(),
            body: body.into(),
            origin: None,
            kind: ChatEventKind::Text,
            event_id: None,
            relation: None,
        }
    }

    /// Creates a reaction with `key` to the event `target`.
    #[must_use]
    pub fn reaction(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_display: impl Into<String>,
        target: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        let key = key.into();
        Self {
            relation: Some(Relation::Reaction {
                target: target.into(),
                key: key.clone(),
            }),
            ..Self::text(room_id, sender_id, sender_display, key)
        }
    }

    /// Sets the chat network's id for this event.
    #[must_use]
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Marks the event as a reply to `target`.
    #[must_use]
    pub fn replying_to(mut self, target: impl Into<String>) -> Self {
        self.relation = Some(Relation::Reply {
            target: target.into(),
        });
        self
    }

    /// Marks the event as relayed from a meshnet.
    #[must_use]
    pub fn with_origin(mut self, origin: OriginTag) -> Self {
        self.origin = Some(origin);
        self
    }
}
