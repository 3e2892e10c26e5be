//! Wire-level definitions for talking to the radio.
//!
//! This module contains:
//! - Stream framing for serial and TCP links
//! - The decoded packet model and its binary layout

pub mod frame;
pub mod packet;

pub use frame::{FrameDecoder, MAX_FRAME_SIZE, encode as encode_frame};
pub use packet::{
    FIRMWARE_VERSION_FIELD, MeshPacket, PACKET_HEADER_LEN, PacketKind, encode_node_info,
    metadata_field, parse_node_info,
};
