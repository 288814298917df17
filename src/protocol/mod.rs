//! Protocol module - packet type and wire header layout.
//!
//! This module holds the pieces every codec and connection share:
//! - [`Packet`], the sequence-tagged payload exchanged between peers
//! - 8-byte [`Header`] encoding/decoding for the length-prefixed wire format

mod packet;
mod wire_format;

pub use packet::{Packet, UNASSIGNED_SEQ};
pub use wire_format::{
    Header, ABSOLUTE_MAX_PAYLOAD_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, LENGTH_PREFIX_SIZE,
};
