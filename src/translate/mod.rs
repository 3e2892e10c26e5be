//! Translation between mesh packets and chat messages.
//!
//! [`RelayTranslator`] is stateless per call: it resolves names through the
//! node store, maps channels to rooms and back, renders prefixes and cuts
//! mesh-bound text to the payload limit. It also decides what must not be
//! relayed at all: direct messages, unmapped channels, bot commands and
//! anything that would loop back into the meshnet it came from.

pub mod template;

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::{
    DEFAULT_CHAT_PREFIX, DEFAULT_MESH_PREFIX, InteractionsConfig, MAX_PACKET_PAYLOAD,
    RelayConfig, RoomMapping,
};
use crate::error::Result;
use crate::protocol::{MeshPacket, PacketKind};
use crate::queue::{OutboundQueue, Priority, QueuedMessage};
use crate::store::{MemoryMessageMap, MessageMap, MessageMapEntry, NodeStore};
use crate::types::{
    ChatEvent, ChatEventKind, Direction, OriginTag, Relation, RelayMessage, RelayTarget,
};

use template::{CHAT_TOKENS, MESH_TOKENS, Template};

/// Prefix for messages relayed from a remote meshnet into the local mesh.
pub const REMOTE_PREFIX: &str = "{short}/{mesh}: ";

/// Characters of a remote meshnet name kept in the remote prefix.
const MESHNET_ABBREV_LEN: usize = 4;

/// Characters of a long name used when no short name is known.
const SHORT_NAME_FALLBACK_LEN: usize = 3;

/// Characters of the original message quoted in a reaction notice.
const REACTION_QUOTE_LEN: usize = 40;

/// Shown when a mesh reaction arrives without its emoji.
const FALLBACK_REACTION: &str = "⚠️";

/// Returns the longest prefix of `text` that fits in `max_bytes` without
/// splitting a character.
#[must_use]
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Cuts `text` to `max_bytes`, ending it with `marker` when anything was cut.
#[must_use]
pub fn truncate_with_marker<'a>(text: &'a str, max_bytes: usize, marker: &str) -> Cow<'a, str> {
    if text.len() <= max_bytes {
        return Cow::Borrowed(text);
    }
    if marker.len() >= max_bytes {
        return Cow::Borrowed(truncate_utf8(text, max_bytes));
    }
    let kept = truncate_utf8(text, max_bytes - marker.len());
    Cow::Owned(format!("{kept}{marker}"))
}

fn first_chars(text: &str, count: usize) -> &str {
    text.char_indices()
        .nth(count)
        .map_or(text, |(end, _)| &text[..end])
}

/// Room and channel lookups in both directions.
#[derive(Debug, Clone, Default)]
pub struct RoomMap {
    by_room: HashMap<String, u8>,
    by_channel: BTreeMap<u8, Vec<String>>,
}

impl RoomMap {
    /// Builds the lookups. A room listed twice keeps its first channel.
    #[must_use]
    pub fn new(mappings: &[RoomMapping]) -> Self {
        let mut map = Self::default();
        for mapping in mappings {
            if map.by_room.contains_key(&mapping.room_id) {
                continue;
            }
            map.by_room.insert(mapping.room_id.clone(), mapping.channel);
            map.by_channel
                .entry(mapping.channel)
                .or_default()
                .push(mapping.room_id.clone());
        }
        map
    }

    /// Channel a room relays to.
    #[must_use]
    pub fn channel_for(&self, room_id: &str) -> Option<u8> {
        self.by_room.get(room_id).copied()
    }

    /// Rooms a channel relays to, in configuration order.
    #[must_use]
    pub fn rooms_for(&self, channel: u8) -> &[String] {
        self.by_channel
            .get(&channel)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn build_template(enabled: bool, format: &str, default: &str, tokens: &[&str]) -> Option<Template> {
    if !enabled {
        return None;
    }
    match Template::parse(format, tokens) {
        Ok(template) => Some(template),
        Err(e) => {
            tracing::warn!("{}, using default prefix {:?}", e, default);
            Template::parse(default, tokens).ok()
        }
    }
}

/// Converts between mesh packets and chat messages.
pub struct RelayTranslator {
    meshnet: String,
    rooms: RoomMap,
    nodes: Arc<dyn NodeStore>,
    messages: Arc<dyn MessageMap>,
    interactions: InteractionsConfig,
    mesh_prefix: Option<Template>,
    chat_prefix: Option<Template>,
    remote_prefix: Option<Template>,
    marker: String,
    max_payload_bytes: usize,
    detection_sensor: bool,
    broadcast_enabled: bool,
    commands: Vec<String>,
}

impl RelayTranslator {
    /// Creates a translator with its own in-memory message map. Invalid
    /// prefix templates fall back to the defaults with a warning.
    #[must_use]
    pub fn new(config: &RelayConfig, nodes: Arc<dyn NodeStore>) -> Self {
        let prefix = &config.prefix;
        let max_payload_bytes = config.max_payload_bytes.min(MAX_PACKET_PAYLOAD);
        if max_payload_bytes < config.max_payload_bytes {
            tracing::warn!(
                "payload limit {} exceeds the packet size, using {}",
                config.max_payload_bytes,
                max_payload_bytes
            );
        }
        Self {
            meshnet: config.meshnet_name.clone(),
            rooms: RoomMap::new(&config.rooms),
            nodes,
            messages: Arc::new(MemoryMessageMap::new(config.interactions.map_capacity)),
            interactions: config.interactions.clone(),
            mesh_prefix: build_template(
                prefix.mesh_enabled,
                &prefix.mesh_format,
                DEFAULT_MESH_PREFIX,
                MESH_TOKENS,
            ),
            chat_prefix: build_template(
                prefix.chat_enabled,
                &prefix.chat_format,
                DEFAULT_CHAT_PREFIX,
                CHAT_TOKENS,
            ),
            remote_prefix: build_template(true, REMOTE_PREFIX, REMOTE_PREFIX, CHAT_TOKENS),
            marker: prefix.truncation_marker.clone(),
            max_payload_bytes,
            detection_sensor: config.detection_sensor,
            broadcast_enabled: config.broadcast_enabled,
            commands: Vec::new(),
        }
    }

    /// Uses a shared message map, typically the one the outbound queue
    /// records sent messages in.
    #[must_use]
    pub fn with_message_map(mut self, messages: Arc<dyn MessageMap>) -> Self {
        self.messages = messages;
        self
    }

    /// Registers command names (without the `!`) that are never relayed.
    #[must_use]
    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands
            .extend(commands.into_iter().map(|c| c.into().to_lowercase()));
        self
    }

    /// Name of the local meshnet.
    #[must_use]
    pub fn meshnet(&self) -> &str {
        &self.meshnet
    }

    /// The room mappings.
    #[must_use]
    pub const fn rooms(&self) -> &RoomMap {
        &self.rooms
    }

    /// Builds one chat message per room mapped to the packet's channel.
    ///
    /// Reactions go to the rooms holding the message reacted to, and with
    /// replies enabled a reply to a known message goes to that message's
    /// rooms as a chat reply. Returns nothing for packets that are not
    /// relayed.
    #[must_use]
    pub fn mesh_to_chat(&self, packet: &MeshPacket) -> Vec<RelayMessage> {
        let detection_sensor = match packet.kind {
            PacketKind::Text => false,
            PacketKind::DetectionSensor if self.detection_sensor => true,
            PacketKind::DetectionSensor => {
                tracing::debug!(from = %packet.from, "detection sensor relaying disabled");
                return Vec::new();
            }
            _ => return Vec::new(),
        };
        if !packet.is_broadcast() {
            tracing::debug!(from = %packet.from, to = %packet.to, "not relaying direct message");
            return Vec::new();
        }
        let text = packet.text_payload().map_or("", str::trim);

        let (long, short) = match self.nodes.get(packet.from) {
            Some(record) => (record.display_long(), record.display_short()),
            None => (packet.from.to_string(), packet.from.to_string()),
        };
        let prefix = self.chat_prefix.as_ref().map_or_else(String::new, |t| {
            t.render(&[
                ("long", long.as_str()),
                ("short", short.as_str()),
                ("mesh", self.meshnet.as_str()),
            ])
        });
        let base = RelayMessage {
            sender_long: long,
            sender_short: short,
            meshnet: self.meshnet.clone(),
            body: format!("{prefix}{text}"),
            text: text.to_string(),
            direction: Direction::MeshToChat,
            target: RelayTarget::Channel(packet.channel),
            packet_id: Some(packet.id),
            sender_node: Some(packet.from),
            detection_sensor,
            reply_to: None,
            emote: false,
        };

        if let Some(reply_id) = packet.reply_id.filter(|_| packet.emoji) {
            if !self.interactions.reactions {
                tracing::debug!(from = %packet.from, "reaction relaying disabled");
                return Vec::new();
            }
            let originals = self.messages.by_packet(reply_id);
            if originals.is_empty() {
                tracing::debug!(reply_id, "reaction to an unknown message, skipping");
            }
            let emoji = if text.is_empty() { FALLBACK_REACTION } else { text };
            return originals
                .into_iter()
                .map(|original| RelayMessage {
                    body: format!(
                        "{prefix}reacted {emoji} to \"{}\"",
                        abbreviate(&original.text)
                    ),
                    target: RelayTarget::Room(original.room_id),
                    emote: true,
                    ..base.clone()
                })
                .collect();
        }

        if text.is_empty() {
            return Vec::new();
        }

        if let Some(reply_id) = packet.reply_id.filter(|_| self.interactions.replies) {
            let originals = self.messages.by_packet(reply_id);
            if !originals.is_empty() {
                tracing::info!(from = %base.sender_long, reply_id, "relaying reply to chat");
                return originals
                    .into_iter()
                    .map(|original| RelayMessage {
                        target: RelayTarget::Room(original.room_id),
                        reply_to: Some(original.chat_event_id),
                        ..base.clone()
                    })
                    .collect();
            }
        }

        let rooms = self.rooms.rooms_for(packet.channel);
        if rooms.is_empty() {
            tracing::debug!(channel = packet.channel, "no room mapped, skipping");
            return Vec::new();
        }

        tracing::info!(from = %base.sender_long, channel = packet.channel, rooms = rooms.len(), "relaying to chat");
        rooms
            .iter()
            .map(|room| RelayMessage {
                target: RelayTarget::Room(room.clone()),
                ..base.clone()
            })
            .collect()
    }

    /// Remembers which chat event a relayed mesh message became, so later
    /// reactions and replies to either side can be resolved.
    ///
    /// Does nothing unless reactions or replies are enabled.
    pub fn record_delivery(&self, message: &RelayMessage, chat_event_id: String) {
        if !self.interactions.any_enabled() || message.emote {
            return;
        }
        let (Some(packet_id), Some(room)) = (message.packet_id, message.room()) else {
            return;
        };
        self.messages.record(MessageMapEntry {
            packet_id,
            chat_event_id,
            room_id: room.to_string(),
            text: message.text.clone(),
            meshnet: message.meshnet.clone(),
        });
    }

    /// Builds the mesh message for a chat event, if it is to be relayed.
    #[must_use]
    pub fn chat_to_mesh(&self, event: &ChatEvent) -> Option<QueuedMessage> {
        let channel = self.rooms.channel_for(&event.room_id)?;

        if event
            .origin
            .as_ref()
            .is_some_and(|origin| origin.meshnet == self.meshnet)
        {
            tracing::debug!(room = %event.room_id, "message originated here, not relaying back");
            return None;
        }
        if !self.broadcast_enabled {
            tracing::debug!(room = %event.room_id, "chat to mesh relaying disabled");
            return None;
        }

        let mut reply_id = None;
        let body = match &event.relation {
            Some(Relation::Reaction { target, key }) => {
                return self.reaction_to_mesh(event, channel, target, key);
            }
            Some(Relation::Reply { target }) => {
                if self.interactions.replies {
                    reply_id = self.messages.by_chat_event(target).map(|e| e.packet_id);
                }
                Cow::Owned(strip_quoted_lines(&event.body))
            }
            None => Cow::Borrowed(event.body.trim()),
        };
        if body.is_empty() || self.is_command(&body) {
            return None;
        }

        let (text, kind, sender, plain) = match (&event.origin, event.kind) {
            (Some(origin), ChatEventKind::DetectionSensor) => {
                if !self.detection_sensor {
                    return None;
                }
                (
                    body.to_string(),
                    PacketKind::DetectionSensor,
                    format!("{}/{}", origin.long_name, origin.meshnet),
                    body.as_ref(),
                )
            }
            (Some(origin), ChatEventKind::Text) => {
                let stripped = self
                    .chat_prefix
                    .as_ref()
                    .and_then(|t| t.strip(&body))
                    .map_or(body.as_ref(), |m| m.body);
                let (short, mesh) = remote_names(origin);
                let prefix = self.remote_prefix.as_ref().map_or_else(String::new, |t| {
                    t.render(&[
                        ("long", origin.long_name.as_str()),
                        ("short", short),
                        ("mesh", mesh),
                    ])
                });
                (
                    format!("{prefix}{stripped}"),
                    PacketKind::Text,
                    format!("{}/{}", origin.long_name, origin.meshnet),
                    stripped,
                )
            }
            (None, ChatEventKind::DetectionSensor) => {
                tracing::debug!(room = %event.room_id, "detection sensor event without origin");
                return None;
            }
            (None, ChatEventKind::Text) => {
                let (prefix, display) = self.mesh_prefix_for(event);
                (
                    format!("{prefix}{body}"),
                    PacketKind::Text,
                    display.to_string(),
                    body.as_ref(),
                )
            }
        };

        let mut message = self.queued(&text, channel, kind, format!("message from {sender}"));
        if let Some(packet_id) = reply_id {
            message = message.reply_to(packet_id);
        }
        if let Some(event_id) = event.event_id.as_ref().filter(|_| self.interactions.any_enabled()) {
            message = message.mapping(MessageMapEntry {
                packet_id: 0,
                chat_event_id: event_id.clone(),
                room_id: event.room_id.clone(),
                text: plain.to_string(),
                meshnet: event
                    .origin
                    .as_ref()
                    .map_or_else(|| self.meshnet.clone(), |o| o.meshnet.clone()),
            });
        }
        Some(message)
    }

    fn reaction_to_mesh(
        &self,
        event: &ChatEvent,
        channel: u8,
        target: &str,
        key: &str,
    ) -> Option<QueuedMessage> {
        if !self.interactions.reactions {
            tracing::debug!(room = %event.room_id, "reaction relaying disabled");
            return None;
        }
        let Some(original) = self.messages.by_chat_event(target) else {
            tracing::debug!(room = %event.room_id, target, "reaction to an unknown message, skipping");
            return None;
        };
        let quoted = abbreviate(&original.text);
        let key = key.trim();

        let (text, sender) = match &event.origin {
            Some(origin) => {
                let (short, mesh) = remote_names(origin);
                (
                    format!("{short}/{mesh} reacted {key} to \"{quoted}\""),
                    format!("{}/{}", origin.long_name, origin.meshnet),
                )
            }
            None => {
                let (prefix, display) = self.mesh_prefix_for(event);
                (
                    format!("{prefix}reacted {key} to \"{quoted}\""),
                    display.to_string(),
                )
            }
        };
        Some(self.queued(&text, channel, PacketKind::Text, format!("reaction from {sender}")))
    }

    /// Renders the mesh-bound prefix for a chat user. Also returns the name
    /// used for them.
    fn mesh_prefix_for<'a>(&self, event: &'a ChatEvent) -> (String, &'a str) {
        let user = event.sender_id.as_str();
        let localpart = user.trim_start_matches('@');
        let (username, server) = localpart.split_once(':').unwrap_or((localpart, ""));
        let display = if event.sender_display.is_empty() {
            user
        } else {
            event.sender_display.as_str()
        };
        let prefix = self.mesh_prefix.as_ref().map_or_else(String::new, |t| {
            t.render(&[
                ("display", display),
                ("user", user),
                ("username", username),
                ("server", server),
            ])
        });
        (prefix, display)
    }

    /// Cuts mesh-bound text to the payload limit and wraps it for the queue.
    fn queued(&self, text: &str, channel: u8, kind: PacketKind, description: String) -> QueuedMessage {
        let payload = truncate_with_marker(text, self.max_payload_bytes, &self.marker);
        if payload.len() < text.len() {
            tracing::debug!(
                size = text.len(),
                max = self.max_payload_bytes,
                "truncated message for the mesh"
            );
        }
        QueuedMessage::new(payload.into_owned(), channel, self.meshnet.as_str())
            .kind(kind)
            .description(description)
    }

    /// Translates a chat event and queues the result.
    ///
    /// Returns the queue depth, or `None` if the event is not relayed.
    ///
    /// # Errors
    ///
    /// Whatever [`OutboundQueue::enqueue`] rejects with.
    pub fn relay_to_mesh(&self, event: &ChatEvent, queue: &OutboundQueue) -> Result<Option<usize>> {
        match self.chat_to_mesh(event) {
            Some(message) => {
                tracing::info!(room = %event.room_id, channel = message.channel, "relaying to mesh");
                queue.enqueue(message, Priority::Normal).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Returns true if `body` invokes a registered command.
    #[must_use]
    pub fn is_command(&self, body: &str) -> bool {
        let Some(invocation) = body.trim_start().strip_prefix('!') else {
            return false;
        };
        let name = invocation
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_lowercase();
        !name.is_empty() && self.commands.contains(&name)
    }

    /// Splits a mesh-bound text into its prefix values and body.
    ///
    /// Returns `None` when the text does not start with the mesh prefix.
    #[must_use]
    pub fn parse_mesh_bound<'a>(&self, text: &'a str) -> Option<template::TemplateMatch<'a>> {
        match &self.mesh_prefix {
            Some(t) => t.strip(text),
            None => Some(template::TemplateMatch {
                values: Vec::new(),
                body: text,
            }),
        }
    }
}

/// Short sender name and abbreviated meshnet for a remote origin.
fn remote_names(origin: &OriginTag) -> (&str, &str) {
    let short = origin
        .short_name
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| first_chars(&origin.long_name, SHORT_NAME_FALLBACK_LEN));
    (short, first_chars(&origin.meshnet, MESHNET_ABBREV_LEN))
}

/// Shortens quoted text in reaction notices.
fn abbreviate(text: &str) -> Cow<'_, str> {
    let kept = first_chars(text, REACTION_QUOTE_LEN);
    if kept.len() < text.len() {
        Cow::Owned(format!("{kept}..."))
    } else {
        Cow::Borrowed(text)
    }
}

/// Drops the `>`-quoted lines chat clients put in reply bodies and joins
/// the rest into one line.
#[must_use]
pub fn strip_quoted_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with('>'))
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrefixConfig;
    use crate::store::MemoryNodeStore;
    use crate::test_support::relay_config;
    use crate::types::{NodeId, NodeRecord};

    fn translator(config: &RelayConfig) -> (RelayTranslator, Arc<MemoryNodeStore>) {
        let nodes = Arc::new(MemoryNodeStore::new());
        (RelayTranslator::new(config, nodes.clone()), nodes)
    }

    fn interactive(
        reactions: bool,
        replies: bool,
    ) -> (RelayTranslator, Arc<MemoryNodeStore>, Arc<MemoryMessageMap>) {
        let config = relay_config().room("r1", 0).interactions(
            InteractionsConfig::new()
                .reactions(reactions)
                .replies(replies),
        );
        let (translator, nodes) = translator(&config);
        let messages = Arc::new(MemoryMessageMap::new(10));
        (translator.with_message_map(messages.clone()), nodes, messages)
    }

    fn sent(packet_id: u32, chat_event_id: &str, text: &str) -> MessageMapEntry {
        MessageMapEntry {
            packet_id,
            chat_event_id: chat_event_id.into(),
            room_id: "r1".into(),
            text: text.into(),
            meshnet: "home".into(),
        }
    }

    fn from(node: u32, packet: MeshPacket) -> MeshPacket {
        MeshPacket {
            from: NodeId::new(node),
            ..packet
        }
    }

    #[test]
    fn test_truncate_never_splits_characters() {
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8("héllo", 3), "hé");
        assert_eq!(truncate_utf8("abc", 10), "abc");

        let cut = truncate_with_marker("ααααα", 7, "…");
        assert_eq!(cut, "αα…");
        assert!(cut.len() <= 7);
        assert_eq!(truncate_with_marker("short", 10, "…"), "short");
    }

    #[test]
    fn test_room_map_fan_out_and_fan_in() {
        let map = RoomMap::new(&[
            RoomMapping {
                room_id: "r1".into(),
                channel: 0,
            },
            RoomMapping {
                room_id: "r2".into(),
                channel: 0,
            },
            RoomMapping {
                room_id: "r3".into(),
                channel: 2,
            },
        ]);
        assert_eq!(map.rooms_for(0), ["r1", "r2"]);
        assert_eq!(map.channel_for("r3"), Some(2));
        assert!(map.rooms_for(5).is_empty());
    }

    #[test]
    fn test_mesh_to_chat_resolves_names() {
        let config = relay_config().room("r1", 0);
        let (translator, nodes) = translator(&config);
        nodes.upsert(NodeRecord::seen_now(NodeId::new(7), "home").with_names("Ridge", "RDG"));

        let messages = translator.mesh_to_chat(&from(7, MeshPacket::text(0, "hello")));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "[Ridge/home]: hello");
        assert_eq!(messages[0].sender_short, "RDG");
        assert_eq!(messages[0].room(), Some("r1"));

        let messages = translator.mesh_to_chat(&from(8, MeshPacket::text(0, "who")));
        assert_eq!(messages[0].body, "[!00000008/home]: who");
    }

    #[test]
    fn test_mesh_to_chat_filters() {
        let config = relay_config().room("r1", 0).detection_sensor(false);
        let (translator, _) = translator(&config);

        let unmapped = from(1, MeshPacket::text(3, "elsewhere"));
        assert!(translator.mesh_to_chat(&unmapped).is_empty());

        let mut direct = from(1, MeshPacket::text(0, "psst"));
        direct.to = NodeId::new(2);
        assert!(translator.mesh_to_chat(&direct).is_empty());

        let sensor = from(1, MeshPacket::broadcast(PacketKind::DetectionSensor, 0, "motion"));
        assert!(translator.mesh_to_chat(&sensor).is_empty());

        let telemetry = from(1, MeshPacket::broadcast(PacketKind::Telemetry, 0, vec![1u8]));
        assert!(translator.mesh_to_chat(&telemetry).is_empty());
    }

    #[test]
    fn test_chat_to_mesh_prefix_and_parse_back() {
        let config = relay_config().room("r1", 1);
        let (translator, _) = translator(&config);

        let event = ChatEvent::text("r1", "@alexandra:example.org", "Alexandra", "on my way");
        let message = translator.chat_to_mesh(&event).unwrap();
        assert_eq!(message.payload, "Alexa[M]: on my way");
        assert_eq!(message.channel, 1);
        assert_eq!(message.origin_meshnet, "home");

        let parsed = translator.parse_mesh_bound(&message.payload).unwrap();
        assert_eq!(parsed.get("display"), Some("Alexa"));
        assert_eq!(parsed.body, "on my way");
    }

    #[test]
    fn test_chat_to_mesh_username_tokens() {
        let config = relay_config()
            .room("r1", 0)
            .prefix(PrefixConfig::new().mesh_format("{username}@{server}> "));
        let (translator, _) = translator(&config);

        let event = ChatEvent::text("r1", "@bob:matrix.org", "Bob", "hi");
        assert_eq!(
            translator.chat_to_mesh(&event).unwrap().payload,
            "bob@matrix.org> hi"
        );
    }

    #[test]
    fn test_invalid_template_falls_back() {
        let config = relay_config()
            .room("r1", 0)
            .prefix(PrefixConfig::new().mesh_format("{nope}: "));
        let (translator, _) = translator(&config);
        let event = ChatEvent::text("r1", "@c:x.org", "Carol", "hey");
        assert_eq!(translator.chat_to_mesh(&event).unwrap().payload, "Carol[M]: hey");
    }

    #[test]
    fn test_disabled_prefix() {
        let config = relay_config()
            .room("r1", 0)
            .prefix(PrefixConfig::new().mesh_enabled(false));
        let (translator, _) = translator(&config);
        let event = ChatEvent::text("r1", "@c:x.org", "Carol", "bare");
        assert_eq!(translator.chat_to_mesh(&event).unwrap().payload, "bare");
    }

    #[test]
    fn test_remote_meshnet_reprefixed() {
        let config = relay_config().room("r1", 0);
        let (translator, _) = translator(&config);

        let event = ChatEvent::text("r1", "@relay:x.org", "Relay", "[Base Station/northside]: storm coming")
            .with_origin(OriginTag {
                meshnet: "northside".into(),
                long_name: "Base Station".into(),
                short_name: None,
            });
        let message = translator.chat_to_mesh(&event).unwrap();
        assert_eq!(message.payload, "Bas/nort: storm coming");

        let event = ChatEvent::text("r1", "@relay:x.org", "Relay", "no prefix")
            .with_origin(OriginTag {
                meshnet: "south".into(),
                long_name: "Valley".into(),
                short_name: Some("VLY".into()),
            });
        assert_eq!(
            translator.chat_to_mesh(&event).unwrap().payload,
            "VLY/sout: no prefix"
        );
    }

    #[test]
    fn test_own_meshnet_not_relayed_back() {
        let config = relay_config().room("r1", 0);
        let (translator, _) = translator(&config);

        let event = ChatEvent::text("r1", "@relay:x.org", "Relay", "[Ridge/home]: hello")
            .with_origin(OriginTag {
                meshnet: "home".into(),
                long_name: "Ridge".into(),
                short_name: None,
            });
        assert!(translator.chat_to_mesh(&event).is_none());
    }

    #[test]
    fn test_commands_not_relayed() {
        let config = relay_config().room("r1", 0);
        let (translator, _) = translator(&config);
        let translator = translator.with_commands(["ping", "Weather"]);

        let event = |body: &str| ChatEvent::text("r1", "@d:x.org", "Dana", body);
        assert!(translator.chat_to_mesh(&event("!ping")).is_none());
        assert!(translator.chat_to_mesh(&event("!weather tomorrow")).is_none());
        assert!(translator.chat_to_mesh(&event("!unknown")).is_some());
        assert!(translator.chat_to_mesh(&event("ping")).is_some());
    }

    #[test]
    fn test_broadcast_disabled() {
        let config = relay_config().room("r1", 0).broadcast_enabled(false);
        let (translator, _) = translator(&config);
        let event = ChatEvent::text("r1", "@d:x.org", "Dana", "hello");
        assert!(translator.chat_to_mesh(&event).is_none());
    }

    #[test]
    fn test_payload_limit_with_marker() {
        let config = relay_config().room("r1", 0);
        let (translator, _) = translator(&config);

        let body = "ü".repeat(200);
        let event = ChatEvent::text("r1", "@e:x.org", "Eve", body);
        let message = translator.chat_to_mesh(&event).unwrap();
        assert!(message.payload.len() <= 227);
        assert!(message.payload.ends_with('…'));
        assert!(message.payload.starts_with("Eve[M]: "));
    }

    #[test]
    fn test_payload_limit_clamped_to_packet_size() {
        let config = relay_config().room("r1", 0).max_payload_bytes(4096);
        let (translator, _) = translator(&config);

        let event = ChatEvent::text("r1", "@e:x.org", "Eve", "z".repeat(1000));
        let message = translator.chat_to_mesh(&event).unwrap();
        assert!(message.payload.len() <= MAX_PACKET_PAYLOAD);

        let queue = OutboundQueue::new(crate::config::QueueConfig::new());
        assert!(queue.enqueue(message, Priority::Normal).is_ok());
    }

    #[test]
    fn test_mesh_reaction_to_relayed_chat_message() {
        let (translator, nodes, messages) = interactive(true, false);
        nodes.upsert(NodeRecord::seen_now(NodeId::new(7), "home").with_names("Ridge", "RDG"));

        let event = ChatEvent::text(
            "r1",
            "@ann:x.org",
            "Ann",
            "see you at the trailhead tomorrow morning around nine",
        )
        .with_event_id("$orig");
        let mut entry = translator.chat_to_mesh(&event).unwrap().mapping.unwrap();
        assert_eq!(entry.text, "see you at the trailhead tomorrow morning around nine");
        entry.packet_id = 77;
        messages.record(entry);

        let reactions = translator.mesh_to_chat(&from(7, MeshPacket::reaction(0, 77, "👍")));
        assert_eq!(reactions.len(), 1);
        assert!(reactions[0].emote);
        assert_eq!(reactions[0].room(), Some("r1"));
        assert_eq!(
            reactions[0].body,
            "[Ridge/home]: reacted 👍 to \"see you at the trailhead tomorrow mornin...\""
        );

        // Nothing known about packet 78
        assert!(translator.mesh_to_chat(&from(7, MeshPacket::reaction(0, 78, "👍"))).is_empty());

        let empty = translator.mesh_to_chat(&from(7, MeshPacket::reaction(0, 77, "")));
        assert!(empty[0].body.contains("reacted ⚠️ to"));
    }

    #[test]
    fn test_reactions_disabled_are_dropped() {
        let (translator, _, messages) = interactive(false, true);
        messages.record(sent(77, "$orig", "hello"));

        assert!(translator.mesh_to_chat(&from(7, MeshPacket::reaction(0, 77, "👍"))).is_empty());

        let reaction = ChatEvent::reaction("r1", "@bob:x.org", "Bob", "$orig", "❤️");
        assert!(translator.chat_to_mesh(&reaction).is_none());
    }

    #[test]
    fn test_no_mapping_recorded_when_interactions_off() {
        let config = relay_config().room("r1", 0);
        let (translator, _) = translator(&config);
        let event = ChatEvent::text("r1", "@a:x.org", "Ann", "hi").with_event_id("$e");
        assert!(translator.chat_to_mesh(&event).unwrap().mapping.is_none());
    }

    #[test]
    fn test_mesh_reply_threads_to_chat_event() {
        let (translator, _, messages) = interactive(false, true);

        let original = translator.mesh_to_chat(&from(7, MeshPacket::text(0, "anyone out?").with_id(5)));
        translator.record_delivery(&original[0], "$ev1".to_string());
        assert_eq!(messages.by_chat_event("$ev1").unwrap().text, "anyone out?");

        let reply = from(8, MeshPacket::text(0, "me too").with_id(6).replying_to(5));
        let messages_out = translator.mesh_to_chat(&reply);
        assert_eq!(messages_out.len(), 1);
        assert_eq!(messages_out[0].reply_to.as_deref(), Some("$ev1"));
        assert_eq!(messages_out[0].room(), Some("r1"));
        assert_eq!(messages_out[0].body, "[!00000008/home]: me too");

        // A reply to an unknown packet is relayed as a plain message
        let stray = translator.mesh_to_chat(&from(8, MeshPacket::text(0, "hm").replying_to(99)));
        assert_eq!(stray.len(), 1);
        assert_eq!(stray[0].reply_to, None);
    }

    #[test]
    fn test_mesh_reply_plain_when_replies_disabled() {
        let (translator, _, messages) = interactive(true, false);
        messages.record(sent(5, "$ev1", "anyone out?"));

        let reply = translator.mesh_to_chat(&from(8, MeshPacket::text(0, "me too").replying_to(5)));
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].reply_to, None);
    }

    #[test]
    fn test_chat_reply_strips_quotes_and_sets_reply_id() {
        let (translator, _, messages) = interactive(false, true);
        messages.record(sent(99, "$m1", "hello"));

        let event = ChatEvent::text(
            "r1",
            "@bob:x.org",
            "Bob",
            "> <@ann:x.org> hello\n> again\nsure thing",
        )
        .replying_to("$m1");
        let message = translator.chat_to_mesh(&event).unwrap();
        assert_eq!(message.payload, "Bob[M]: sure thing");
        assert_eq!(message.reply_id, Some(99));
        assert_eq!(message.to_packet().reply_id, Some(99));

        let unknown = event.clone().replying_to("$other");
        let message = translator.chat_to_mesh(&unknown).unwrap();
        assert_eq!(message.payload, "Bob[M]: sure thing");
        assert_eq!(message.reply_id, None);
    }

    #[test]
    fn test_chat_reaction_to_mesh() {
        let (translator, _, messages) = interactive(true, false);
        messages.record(sent(99, "$m1", "hello"));

        let local = ChatEvent::reaction("r1", "@bob:x.org", "Bob", "$m1", "❤️");
        let message = translator.chat_to_mesh(&local).unwrap();
        assert_eq!(message.payload, "Bob[M]: reacted ❤️ to \"hello\"");
        assert_eq!(message.channel, 0);

        let remote = ChatEvent::reaction("r1", "@relay:x.org", "Relay", "$m1", "❤️").with_origin(
            OriginTag {
                meshnet: "northside".into(),
                long_name: "Base Station".into(),
                short_name: None,
            },
        );
        assert_eq!(
            translator.chat_to_mesh(&remote).unwrap().payload,
            "Bas/nort reacted ❤️ to \"hello\""
        );

        let unknown = ChatEvent::reaction("r1", "@bob:x.org", "Bob", "$nope", "❤️");
        assert!(translator.chat_to_mesh(&unknown).is_none());
    }

    #[test]
    fn test_strip_quoted_lines() {
        assert_eq!(strip_quoted_lines("> quoted\nfirst\n  > also\nsecond"), "first second");
        assert_eq!(strip_quoted_lines("> only quotes"), "");
        assert_eq!(strip_quoted_lines("plain"), "plain");
    }
}
