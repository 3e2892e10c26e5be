//! Data types shared across the relay.
//!
//! - Node identity and metadata
//! - Messages moving between the mesh and chat rooms

pub mod message;
pub mod node;

pub use message::{
    ChatEvent, ChatEventKind, Direction, OriginTag, Relation, RelayMessage, RelayTarget,
};
pub use node::{NodeId, NodeRecord};
