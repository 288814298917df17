//! The unit of communication exchanged between peers.

use bytes::Bytes;

/// Sequence id carried by packets that are not (yet) correlated.
pub const UNASSIGNED_SEQ: i32 = -1;

/// A sequence-tagged payload.
///
/// The data length on the wire is always derived from `payload`, so a packet
/// can never disagree with itself about its size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Correlation id. Negative means "not correlated".
    pub seq: i32,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Packet {
    /// Create an uncorrelated packet.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            seq: UNASSIGNED_SEQ,
            payload: payload.into(),
        }
    }

    /// Create a packet with an explicit sequence id.
    pub fn with_seq(seq: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            payload: payload.into(),
        }
    }

    /// Build a response carrying the same sequence id as `self`.
    pub fn reply(&self, payload: impl Into<Bytes>) -> Self {
        Self::with_seq(self.seq, payload)
    }

    /// Payload length in bytes.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.payload.len()
    }

    /// Whether this packet carries a correlation id.
    #[inline]
    pub fn is_assigned(&self) -> bool {
        self.seq >= 0
    }

    /// Borrow the payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
