//! Newline-delimited text frames.
//!
//! Each frame is one line: the decimal seq, a single space, then the payload
//! with `\` written as `\\` and newline written as `\n`. Handy for debugging
//! with `nc` or for talking to scripts.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};

use super::{Codec, FrameReader};
use crate::error::{Result, SeqlinkError};
use crate::protocol::Packet;
use crate::BoxFuture;

/// Default maximum line length, excluding the terminating newline.
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// Text codec: `"<seq> <escaped payload>\n"`.
#[derive(Debug, Clone, Copy)]
pub struct LineCodec {
    max_line_len: usize,
}

impl LineCodec {
    /// Codec accepting lines up to [`DEFAULT_MAX_LINE_LEN`] bytes.
    pub fn new() -> Self {
        Self {
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }

    /// Codec with a custom maximum line length.
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self { max_line_len }
    }

    /// Length of the encoded line for `packet`, without the newline.
    fn encoded_len(packet: &Packet) -> usize {
        let escapes = packet
            .payload()
            .iter()
            .filter(|&&b| b == b'\\' || b == b'\n')
            .count();
        packet.seq.to_string().len() + 1 + packet.data_len() + escapes
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for LineCodec {
    fn read_frame<'a>(&'a self, reader: &'a mut FrameReader) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            let mut line = Vec::new();
            let limit = self.max_line_len as u64 + 1;
            let n = (&mut *reader)
                .take(limit)
                .read_until(b'\n', &mut line)
                .await?;

            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }

            if line.last() != Some(&b'\n') {
                if line.len() as u64 >= limit {
                    return Err(SeqlinkError::Decode(format!(
                        "Line exceeds maximum length {}",
                        self.max_line_len
                    )));
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a line",
                )
                .into());
            }

            line.pop();
            Ok(Bytes::from(line))
        })
    }

    fn decode(&self, raw: Bytes) -> Result<Packet> {
        let space = raw
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| SeqlinkError::Decode("Line has no seq separator".into()))?;

        let seq = std::str::from_utf8(&raw[..space])
            .ok()
            .and_then(|s| s.parse::<i32>().ok())
            .ok_or_else(|| SeqlinkError::Decode("Line seq is not an integer".into()))?;

        let escaped = &raw[space + 1..];
        let mut payload = Vec::with_capacity(escaped.len());
        let mut bytes = escaped.iter().copied();
        while let Some(b) = bytes.next() {
            if b != b'\\' {
                payload.push(b);
                continue;
            }
            match bytes.next() {
                Some(b'\\') => payload.push(b'\\'),
                Some(b'n') => payload.push(b'\n'),
                Some(other) => {
                    return Err(SeqlinkError::Decode(format!(
                        "Unknown escape \\{}",
                        char::from(other)
                    )))
                }
                None => return Err(SeqlinkError::Decode("Dangling escape at end of line".into())),
            }
        }

        Ok(Packet::with_seq(seq, payload))
    }

    fn encode(&self, packet: &Packet) -> Bytes {
        let mut line = Vec::with_capacity(Self::encoded_len(packet) + 1);
        line.extend_from_slice(packet.seq.to_string().as_bytes());
        line.push(b' ');
        for &b in packet.payload() {
            match b {
                b'\\' => line.extend_from_slice(b"\\\\"),
                b'\n' => line.extend_from_slice(b"\\n"),
                _ => line.push(b),
            }
        }
        line.push(b'\n');
        Bytes::from(line)
    }

    fn validate(&self, packet: &Packet) -> Result<()> {
        let len = Self::encoded_len(packet);
        if len > self.max_line_len {
            return Err(SeqlinkError::PayloadTooLarge {
                len,
                max: self.max_line_len,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[test]
    fn test_encode_format() {
        let codec = LineCodec::new();
        let bytes = codec.encode(&Packet::with_seq(12, "hi there"));
        assert_eq!(&bytes[..], b"12 hi there\n");
    }

    #[test]
    fn test_escapes_survive_decode() {
        let codec = LineCodec::new();
        let original = Packet::with_seq(-1, "a\nb\\c\\n");

        let encoded = codec.encode(&original);
        assert_eq!(encoded.iter().filter(|&&b| b == b'\n').count(), 1);

        let raw = encoded.slice(..encoded.len() - 1);
        assert_eq!(codec.decode(raw).unwrap(), original);
    }

    #[test]
    fn test_decode_rejects_bad_seq() {
        let codec = LineCodec::new();
        assert!(codec.decode(Bytes::from_static(b"abc payload")).is_err());
        assert!(codec.decode(Bytes::from_static(b"no-separator")).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_escape() {
        let codec = LineCodec::new();
        let err = codec.decode(Bytes::from_static(b"1 bad\\t")).unwrap_err();
        assert!(matches!(err, SeqlinkError::Decode(_)));
    }

    #[test]
    fn test_empty_payload() {
        let codec = LineCodec::new();
        let packet = codec.decode(Bytes::from_static(b"5 ")).unwrap();
        assert_eq!(packet, Packet::with_seq(5, Bytes::new()));
    }

    #[test]
    fn test_validate_counts_escapes() {
        let codec = LineCodec::with_max_line_len(6);
        // "1 " + 4 bytes = 6
        assert!(codec.validate(&Packet::with_seq(1, "abcd")).is_ok());
        // "1 " + "a\\nbc" = 7
        assert!(codec.validate(&Packet::with_seq(1, "a\nbc")).is_err());
    }

    #[tokio::test]
    async fn test_read_frame_splits_lines() {
        let codec = LineCodec::new();
        let mut reader = BufReader::new(Cursor::new(b"1 one\n2 two\n".to_vec()));

        let first = codec.read_frame(&mut reader).await.unwrap();
        let second = codec.read_frame(&mut reader).await.unwrap();
        assert_eq!(&first[..], b"1 one");
        assert_eq!(&second[..], b"2 two");
        assert!(codec.read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_long_line() {
        let codec = LineCodec::with_max_line_len(4);
        let mut reader = BufReader::new(Cursor::new(b"1 toolong\n".to_vec()));

        let err = codec.read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, SeqlinkError::Decode(_)));
    }

    proptest! {
        #[test]
        fn prop_line_survives_decode(
            seq in any::<i32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let codec = LineCodec::new();
            let packet = Packet::with_seq(seq, payload);
            let line = codec.encode(&packet);

            // exactly one newline, and it terminates the line
            prop_assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
            prop_assert_eq!(line.last(), Some(&b'\n'));
            let decoded = codec.decode(line.slice(..line.len() - 1)).unwrap();
            prop_assert_eq!(decoded, packet);
        }
    }
}
