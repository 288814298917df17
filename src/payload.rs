//! Typed payloads encoded as MessagePack.
//!
//! Packets carry opaque bytes. When both ends are Rust (or speak
//! MessagePack), [`MsgPack`] turns serde types into payloads and back. Structs
//! are written in map form (`to_vec_named`) so field order does not have to
//! match between peers.
//!
//! # Example
//!
//! ```
//! use seqlink::payload::MsgPack;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Quote {
//!     symbol: String,
//!     price: u64,
//! }
//!
//! let quote = Quote { symbol: "ACME".to_string(), price: 1250 };
//! let bytes = MsgPack::encode(&quote).unwrap();
//! let decoded: Quote = MsgPack::decode(&bytes).unwrap();
//! assert_eq!(decoded, quote);
//! ```

use bytes::Bytes;

use crate::error::Result;

/// MessagePack encoding for packet payloads.
pub struct MsgPack;

impl MsgPack {
    /// Encode a value into payload bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
    }

    /// Decode payload bytes into a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Order {
        id: u32,
        side: String,
        qty: i64,
    }

    #[test]
    fn test_struct_uses_map_format() {
        let order = Order {
            id: 1,
            side: "buy".to_string(),
            qty: 10,
        };

        let encoded = MsgPack::encode(&order).unwrap();

        // fixmap marker, not fixarray (0x9X)
        assert_eq!(encoded[0] & 0xF0, 0x80, "got {:02X}", encoded[0]);
        assert_eq!(MsgPack::decode::<Order>(&encoded).unwrap(), order);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let result: Result<Order> = MsgPack::decode(b"definitely not msgpack");
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_wrong_shape() {
        let encoded = MsgPack::encode(&vec![1, 2, 3]).unwrap();
        assert!(MsgPack::decode::<Order>(&encoded).is_err());
    }

    #[test]
    fn test_binary_blob_is_compact() {
        let blob: Vec<u8> = (0..=255).collect();
        let encoded = MsgPack::encode(&serde_bytes::Bytes::new(&blob)).unwrap();

        // bin16: marker plus a two-byte length
        assert_eq!(encoded[0], 0xC5);
        assert_eq!(encoded.len(), 3 + blob.len());

        let decoded: serde_bytes::ByteBuf = MsgPack::decode(&encoded).unwrap();
        assert_eq!(decoded.into_vec(), blob);
    }
}
