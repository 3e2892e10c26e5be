//! Decoded mesh packets and their binary layout.
//!
//! Every frame payload carries one packet:
//! ```text
//! [kind:1] [id:4BE] [from:4BE] [to:4BE] [channel:1] [flags:1] [reply_id:4BE] [payload...]
//! ```
//! A zero `reply_id` means the packet answers nothing. Emoji-flagged text
//! packets that carry a `reply_id` are reactions to that packet.
//! The payload layout depends on the kind: UTF-8 text for text and
//! detection-sensor packets, length-prefixed names for node info, and
//! `key=value;` pairs for device metadata.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::NodeId;

/// Size of the fixed packet header.
pub const PACKET_HEADER_LEN: usize = 19;

/// Flag bit requesting an acknowledgment from the destination.
const FLAG_WANT_ACK: u8 = 0x01;

/// Flag bit marking the text payload as a single emoji reaction.
const FLAG_EMOJI: u8 = 0x02;

/// Metadata field whose presence proves the radio is answering.
pub const FIRMWARE_VERSION_FIELD: &str = "firmware_version";

/// Packet kinds understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Plain text message.
    Text = 0x01,
    /// Position report.
    Position = 0x03,
    /// Node identity (long and short name).
    NodeInfo = 0x04,
    /// Detection sensor event (text payload).
    DetectionSensor = 0x0A,
    /// Device metadata request (health probe).
    MetadataRequest = 0x20,
    /// Device metadata response.
    Metadata = 0x21,
    /// Telemetry report.
    Telemetry = 0x43,
}

impl PacketKind {
    /// Parses a packet kind from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Text),
            0x03 => Some(Self::Position),
            0x04 => Some(Self::NodeInfo),
            0x0A => Some(Self::DetectionSensor),
            0x20 => Some(Self::MetadataRequest),
            0x21 => Some(Self::Metadata),
            0x43 => Some(Self::Telemetry),
            _ => None,
        }
    }

    /// Returns true for kinds whose payload is human-readable text.
    #[must_use]
    pub const fn is_textual(self) -> bool {
        matches!(self, Self::Text | Self::DetectionSensor)
    }
}

/// A decoded mesh packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshPacket {
    /// Packet id assigned by the sender.
    pub id: u32,
    /// Sending node.
    pub from: NodeId,
    /// Destination node ([`NodeId::BROADCAST`] for channel traffic).
    pub to: NodeId,
    /// Channel index.
    pub channel: u8,
    /// What the payload contains.
    pub kind: PacketKind,
    /// Whether the sender asked for an acknowledgment.
    pub want_ack: bool,
    /// Packet this one replies or reacts to.
    pub reply_id: Option<u32>,
    /// Whether the text payload is an emoji reaction.
    pub emoji: bool,
    /// Raw payload.
    pub payload: Bytes,
}

impl MeshPacket {
    /// Creates a broadcast packet of the given kind on a channel.
    #[must_use]
    pub fn broadcast(kind: PacketKind, channel: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            id: 0,
            from: NodeId::UNKNOWN,
            to: NodeId::BROADCAST,
            channel,
            kind,
            want_ack: false,
            reply_id: None,
            emoji: false,
            payload: payload.into(),
        }
    }

    /// Creates a broadcast text packet.
    #[must_use]
    pub fn text(channel: u8, text: &str) -> Self {
        Self::broadcast(
            PacketKind::Text,
            channel,
            Bytes::copy_from_slice(text.as_bytes()),
        )
    }

    /// Creates the metadata request used as a health probe.
    #[must_use]
    pub fn metadata_request() -> Self {
        Self::broadcast(PacketKind::MetadataRequest, 0, Bytes::new())
    }

    /// Sets the packet id.
    #[must_use]
    pub const fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Marks the packet as a reply to `id`.
    #[must_use]
    pub const fn replying_to(mut self, id: u32) -> Self {
        self.reply_id = Some(id);
        self
    }

    /// Creates an emoji reaction to packet `id`.
    #[must_use]
    pub fn reaction(channel: u8, id: u32, emoji: &str) -> Self {
        Self {
            emoji: true,
            ..Self::text(channel, emoji).replying_to(id)
        }
    }

    /// Returns true for emoji reactions to another packet.
    #[must_use]
    pub const fn is_reaction(&self) -> bool {
        self.emoji && self.reply_id.is_some()
    }

    /// Returns the payload as text for textual kinds.
    ///
    /// Returns `None` for non-text kinds and for payloads that are not
    /// valid UTF-8.
    #[must_use]
    pub fn text_payload(&self) -> Option<&str> {
        if !self.kind.is_textual() {
            return None;
        }
        std::str::from_utf8(&self.payload).ok()
    }

    /// Returns true if the packet is addressed to everyone on its channel.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.to == NodeId::BROADCAST
    }

    /// Encodes the packet into its binary layout.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.id);
        buf.put_u32(self.from.as_u32());
        buf.put_u32(self.to.as_u32());
        buf.put_u8(self.channel);
        let mut flags = 0;
        if self.want_ack {
            flags |= FLAG_WANT_ACK;
        }
        if self.emoji {
            flags |= FLAG_EMOJI;
        }
        buf.put_u8(flags);
        buf.put_u32(self.reply_id.unwrap_or(0));
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parses a packet from a frame payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PACKET_HEADER_LEN {
            return Err(Error::malformed(format!(
                "packet too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = std::io::Cursor::new(data);

        let kind_byte = cursor.get_u8();
        let kind = PacketKind::from_byte(kind_byte)
            .ok_or_else(|| Error::malformed(format!("unknown packet kind 0x{kind_byte:02x}")))?;
        let id = cursor.get_u32();
        let from = NodeId::new(cursor.get_u32());
        let to = NodeId::new(cursor.get_u32());
        let channel = cursor.get_u8();
        let flags = cursor.get_u8();
        let reply_id = Some(cursor.get_u32()).filter(|&id| id != 0);

        let payload = Bytes::copy_from_slice(&data[PACKET_HEADER_LEN..]);

        if kind.is_textual() && std::str::from_utf8(&payload).is_err() {
            return Err(Error::malformed("text payload is not valid UTF-8"));
        }

        Ok(Self {
            id,
            from,
            to,
            channel,
            kind,
            want_ack: flags & FLAG_WANT_ACK != 0,
            reply_id,
            emoji: flags & FLAG_EMOJI != 0,
            payload,
        })
    }
}

/// Parses a node-info payload into `(long_name, short_name)`.
///
/// Format:
/// ```text
/// [long_len:1] [long_name:long_len] [short_name:...]
/// ```
pub fn parse_node_info(payload: &[u8]) -> Result<(String, String)> {
    let (&long_len, rest) = payload
        .split_first()
        .ok_or_else(|| Error::malformed("node info empty"))?;
    let long_len = usize::from(long_len);
    if rest.len() < long_len {
        return Err(Error::malformed(format!(
            "node info long name truncated: need {long_len} bytes, got {}",
            rest.len()
        )));
    }

    let long_name = String::from_utf8_lossy(&rest[..long_len]).trim().to_string();
    let short_name = String::from_utf8_lossy(&rest[long_len..]).trim().to_string();
    Ok((long_name, short_name))
}

/// Encodes a node-info payload.
///
/// Long names longer than 255 bytes are cut on a character boundary.
#[must_use]
pub fn encode_node_info(long_name: &str, short_name: &str) -> Bytes {
    let long = crate::translate::truncate_utf8(long_name, usize::from(u8::MAX));
    let mut buf = BytesMut::with_capacity(1 + long.len() + short_name.len());
    buf.put_u8(long.len() as u8);
    buf.put_slice(long.as_bytes());
    buf.put_slice(short_name.as_bytes());
    buf.freeze()
}

/// Looks up a field in a metadata payload (`key=value;key=value`).
#[must_use]
pub fn metadata_field<'a>(payload: &'a [u8], key: &str) -> Option<&'a str> {
    let text = std::str::from_utf8(payload).ok()?;
    text.split(';').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k.trim() == key).then(|| v.trim()).filter(|v| !v.is_empty())
    })
}
