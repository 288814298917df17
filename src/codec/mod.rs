//! Codec module - framing packets on a byte stream.
//!
//! A [`Codec`] knows three things: how to pull one raw frame off a buffered
//! reader, how to turn that frame into a [`Packet`], and how to turn a
//! [`Packet`] back into bytes. Sessions only ever talk to the trait, so the
//! wire format is swappable per client or server:
//!
//! - [`LengthPrefixedCodec`] - the default binary format (`u32` length prefix,
//!   `i32` seq, `i32` data length, payload)
//! - [`LineCodec`] - newline-delimited text frames
//!
//! # Example
//!
//! ```
//! use seqlink::codec::{Codec, LengthPrefixedCodec};
//! use seqlink::protocol::Packet;
//!
//! let codec = LengthPrefixedCodec::new();
//! let bytes = codec.encode(&Packet::with_seq(7, "ab"));
//! assert_eq!(
//!     &bytes[..],
//!     &[0, 0, 0, 10, 0, 0, 0, 7, 0, 0, 0, 2, b'a', b'b']
//! );
//!
//! // decode() takes the frame without its length prefix
//! let packet = codec.decode(bytes.slice(4..)).unwrap();
//! assert_eq!(packet.seq, 7);
//! assert_eq!(packet.payload(), b"ab");
//! ```

mod length_prefixed;
mod line;

pub use length_prefixed::LengthPrefixedCodec;
pub use line::{LineCodec, DEFAULT_MAX_LINE_LEN};

use bytes::Bytes;
use tokio::io::AsyncBufRead;

use crate::error::Result;
use crate::protocol::Packet;
use crate::BoxFuture;

/// Buffered byte source a codec reads frames from.
pub type FrameReader = dyn AsyncBufRead + Unpin + Send;

/// Pluggable wire format.
///
/// Implementations must be stateless with respect to any single connection:
/// one codec instance is shared by every session it is handed to.
pub trait Codec: Send + Sync + 'static {
    /// Read the next raw frame from `reader`.
    ///
    /// An end-of-stream before the first byte of a frame surfaces as an
    /// [`std::io::ErrorKind::UnexpectedEof`] I/O error.
    fn read_frame<'a>(&'a self, reader: &'a mut FrameReader) -> BoxFuture<'a, Result<Bytes>>;

    /// Parse a raw frame produced by [`Codec::read_frame`].
    fn decode(&self, raw: Bytes) -> Result<Packet>;

    /// Serialize a packet into a complete frame, ready for the socket.
    fn encode(&self, packet: &Packet) -> Bytes;

    /// Reject packets this codec cannot frame.
    ///
    /// Called before a packet is queued for writing, so `encode` never has to
    /// fail.
    fn validate(&self, _packet: &Packet) -> Result<()> {
        Ok(())
    }
}
