//! Node identity and metadata.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

/// A 32-bit mesh node number.
///
/// Displayed in the usual `!xxxxxxxx` form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// Destination used for channel-wide traffic.
    pub const BROADCAST: Self = Self(0xffff_ffff);

    /// Sender placeholder for locally originated packets; the radio fills in
    /// its own number.
    pub const UNKNOWN: Self = Self(0);

    /// Wraps a raw node number.
    #[must_use]
    pub const fn new(num: u32) -> Self {
        Self(num)
    }

    /// Returns the raw node number.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    /// Accepts `!a1b2c3d4`, bare hex, or a decimal number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hex) = s.strip_prefix('!') {
            return u32::from_str_radix(hex, 16).map(Self);
        }
        s.parse::<u32>()
            .or_else(|_| u32::from_str_radix(s, 16))
            .map(Self)
    }
}

/// What the relay knows about a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// Node number.
    pub id: NodeId,
    /// Long display name, if announced.
    pub long_name: Option<String>,
    /// Short display name, if announced.
    pub short_name: Option<String>,
    /// Meshnet the node was heard on.
    pub meshnet: String,
    /// When a packet from this node was last received.
    pub last_seen: SystemTime,
}

impl NodeRecord {
    /// Creates a record for a node heard just now, without names.
    #[must_use]
    pub fn seen_now(id: NodeId, meshnet: impl Into<String>) -> Self {
        Self {
            id,
            long_name: None,
            short_name: None,
            meshnet: meshnet.into(),
            last_seen: SystemTime::now(),
        }
    }

    /// Sets both display names.
    #[must_use]
    pub fn with_names(mut self, long_name: impl Into<String>, short_name: impl Into<String>) -> Self {
        self.long_name = Some(long_name.into()).filter(|n: &String| !n.is_empty());
        self.short_name = Some(short_name.into()).filter(|n: &String| !n.is_empty());
        self
    }

    /// Long name, falling back to the raw id string.
    #[must_use]
    pub fn display_long(&self) -> String {
        self.long_name
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Short name, falling back to the raw id string.
    #[must_use]
    pub fn display_short(&self) -> String {
        self.short_name
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}
