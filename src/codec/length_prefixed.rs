//! Default binary wire format.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncReadExt;

use super::{Codec, FrameReader};
use crate::error::{Result, SeqlinkError};
use crate::protocol::{
    Header, Packet, ABSOLUTE_MAX_PAYLOAD_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE,
    LENGTH_PREFIX_SIZE,
};
use crate::BoxFuture;

/// `[u32 frame length][i32 seq][i32 data len][payload]`, all big-endian.
///
/// Frames whose payload would exceed `max_payload_len` are rejected on both
/// the read side (before any allocation) and the write side.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixedCodec {
    max_payload_len: usize,
}

impl LengthPrefixedCodec {
    /// Codec with the default 16 MiB payload limit.
    pub fn new() -> Self {
        Self {
            max_payload_len: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Codec with a custom payload limit, clamped to what the wire can express.
    pub fn with_max_payload_len(max_payload_len: usize) -> Self {
        Self {
            max_payload_len: max_payload_len.min(ABSOLUTE_MAX_PAYLOAD_SIZE),
        }
    }

    /// Largest accepted payload in bytes.
    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for LengthPrefixedCodec {
    fn read_frame<'a>(&'a self, reader: &'a mut FrameReader) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            let frame_len = reader.read_u32().await? as usize;

            if frame_len < HEADER_SIZE {
                return Err(SeqlinkError::Decode(format!(
                    "Frame length {} shorter than {}-byte header",
                    frame_len, HEADER_SIZE
                )));
            }

            let payload_len = frame_len - HEADER_SIZE;
            if payload_len > self.max_payload_len {
                return Err(SeqlinkError::PayloadTooLarge {
                    len: payload_len,
                    max: self.max_payload_len,
                });
            }

            let mut frame = BytesMut::zeroed(frame_len);
            reader.read_exact(&mut frame).await?;
            Ok(frame.freeze())
        })
    }

    fn decode(&self, raw: Bytes) -> Result<Packet> {
        let header = Header::decode(&raw).ok_or_else(|| {
            SeqlinkError::Decode(format!(
                "Frame of {} bytes shorter than {}-byte header",
                raw.len(),
                HEADER_SIZE
            ))
        })?;
        header.validate(raw.len() - HEADER_SIZE)?;

        Ok(Packet::with_seq(header.seq, raw.slice(HEADER_SIZE..)))
    }

    fn encode(&self, packet: &Packet) -> Bytes {
        let header = Header::new(packet.seq, packet.data_len() as i32);

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + HEADER_SIZE + packet.data_len());
        buf.put_u32(header.frame_length());
        buf.put_slice(&header.encode());
        buf.put_slice(packet.payload());
        buf.freeze()
    }

    fn validate(&self, packet: &Packet) -> Result<()> {
        if packet.data_len() > self.max_payload_len {
            return Err(SeqlinkError::PayloadTooLarge {
                len: packet.data_len(),
                max: self.max_payload_len,
            });
        }
        Ok(())
    }
}
