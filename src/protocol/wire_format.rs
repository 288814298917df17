//! Wire format encoding and decoding.
//!
//! Every frame is a length prefix followed by an 8-byte header and the payload:
//! ```text
//! ┌──────────────┬──────────┬──────────┬─────────────────┐
//! │ Frame length │ Seq      │ Data len │ Payload         │
//! │ 4 bytes      │ 4 bytes  │ 4 bytes  │ data len bytes  │
//! │ uint32 BE    │ int32 BE │ int32 BE │                 │
//! └──────────────┴──────────┴──────────┴─────────────────┘
//! ```
//!
//! `frame length = 8 + data len`, i.e. it counts the header but not itself.

use crate::error::{Result, SeqlinkError};

/// Size of the frame length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Header size in bytes (seq + data len).
pub const HEADER_SIZE: usize = 8;

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload representable by the `int32` data length field.
pub const ABSOLUTE_MAX_PAYLOAD_SIZE: usize = i32::MAX as usize - HEADER_SIZE;

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sequence id (negative = unassigned).
    pub seq: i32,
    /// Payload length in bytes.
    pub data_len: i32,
}

impl Header {
    /// Create a new header.
    pub fn new(seq: i32, data_len: i32) -> Self {
        Self { seq, data_len }
    }

    /// Value of the length prefix that precedes this header on the wire.
    #[inline]
    pub fn frame_length(&self) -> u32 {
        HEADER_SIZE as u32 + self.data_len as u32
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use seqlink::protocol::Header;
    ///
    /// let bytes = Header::new(42, 5).encode();
    /// assert_eq!(bytes, [0, 0, 0, 42, 0, 0, 0, 5]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.seq.to_be_bytes());
        buf[4..8].copy_from_slice(&self.data_len.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            seq: i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            data_len: i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// Check that the declared data length matches the bytes that follow
    /// the header.
    pub fn validate(&self, remaining: usize) -> Result<()> {
        if self.data_len < 0 {
            return Err(SeqlinkError::Decode(format!(
                "Negative data length {}",
                self.data_len
            )));
        }

        if self.data_len as usize != remaining {
            return Err(SeqlinkError::Decode(format!(
                "Declared data length {} does not match {} remaining bytes",
                self.data_len, remaining
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(-1, 100);
        let decoded = Header::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let bytes = Header::new(0x0102_0304, 0x0506_0708).encode();
        assert_eq!(bytes, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn test_negative_seq_encoding() {
        let bytes = Header::new(-1, 0).encode();
        assert_eq!(&bytes[..4], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(Header::decode(&[0u8; 7]).is_none());
    }

    #[test]
    fn test_frame_length_counts_header() {
        assert_eq!(Header::new(1, 0).frame_length(), 8);
        assert_eq!(Header::new(1, 4).frame_length(), 12);
    }

    #[test]
    fn test_validate_length_mismatch() {
        let header = Header::new(1, 10);
        assert!(header.validate(10).is_ok());

        let err = header.validate(9).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_validate_negative_length() {
        let err = Header::new(1, -3).validate(0).unwrap_err();
        assert!(err.to_string().contains("Negative data length"));
    }
}
