//! Node metadata and message-id lookup.
//!
//! The relay only needs keyed get/upsert with last-write-wins semantics.
//! Durable storage belongs to the embedding application; [`MemoryNodeStore`]
//! and [`MemoryMessageMap`] cover tests and deployments that don't need
//! names or reply targets to survive a restart.

use std::collections::{HashMap, VecDeque};

use parking_lot::{Mutex, RwLock};

use crate::types::{NodeId, NodeRecord};

/// Keyed store of node records.
pub trait NodeStore: Send + Sync {
    /// Returns the record for a node, if known.
    fn get(&self, id: NodeId) -> Option<NodeRecord>;

    /// Inserts or replaces a record.
    fn upsert(&self, record: NodeRecord);
}

/// In-memory [`NodeStore`].
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<HashMap<NodeId, NodeRecord>>,
}

impl MemoryNodeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Returns true if no node is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl NodeStore for MemoryNodeStore {
    fn get(&self, id: NodeId) -> Option<NodeRecord> {
        self.nodes.read().get(&id).cloned()
    }

    fn upsert(&self, record: NodeRecord) {
        self.nodes.write().insert(record.id, record);
    }
}

/// Links a mesh packet to the chat event it was relayed as (or from).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMapEntry {
    /// Mesh packet id.
    pub packet_id: u32,
    /// Chat event id.
    pub chat_event_id: String,
    /// Room the chat event lives in.
    pub room_id: String,
    /// Message text without any prefix.
    pub text: String,
    /// Meshnet the message originated from.
    pub meshnet: String,
}

/// Bounded record of relayed messages, used to resolve reactions and
/// replies to their counterpart on the other side.
pub trait MessageMap: Send + Sync {
    /// Stores an entry, pruning the oldest ones beyond capacity.
    fn record(&self, entry: MessageMapEntry);

    /// All entries for a mesh packet (one per room it reached).
    fn by_packet(&self, packet_id: u32) -> Vec<MessageMapEntry>;

    /// The entry for a chat event.
    fn by_chat_event(&self, event_id: &str) -> Option<MessageMapEntry>;
}

/// Entries kept by default.
pub const DEFAULT_MAP_CAPACITY: usize = 500;

/// In-memory [`MessageMap`] holding the most recent entries.
#[derive(Debug)]
pub struct MemoryMessageMap {
    capacity: usize,
    entries: Mutex<VecDeque<MessageMapEntry>>,
}

impl MemoryMessageMap {
    /// Creates a map keeping at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryMessageMap {
    fn default() -> Self {
        Self::new(DEFAULT_MAP_CAPACITY)
    }
}

impl MessageMap for MemoryMessageMap {
    fn record(&self, entry: MessageMapEntry) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        entries.retain(|e| e.chat_event_id != entry.chat_event_id);
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    fn by_packet(&self, packet_id: u32) -> Vec<MessageMapEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.packet_id == packet_id)
            .cloned()
            .collect()
    }

    fn by_chat_event(&self, event_id: &str) -> Option<MessageMapEntry> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|e| e.chat_event_id == event_id)
            .cloned()
    }
}

/// Records that a packet from `id` was just received, keeping known names.
pub(crate) fn touch(store: &dyn NodeStore, id: NodeId, meshnet: &str) {
    let record = match store.get(id) {
        Some(mut existing) => {
            existing.last_seen = std::time::SystemTime::now();
            existing
        }
        None => NodeRecord::seen_now(id, meshnet),
    };
    store.upsert(record);
}
