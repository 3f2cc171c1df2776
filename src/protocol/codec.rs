//! Message encoding and decoding.
//!
//! Layout (big-endian, fixed width, zero-padded on the high-order side):
//!
//! ```text
//! +----+---------+------------------+---------------------------+
//! | op | seq (4) |     key (16)     |  value (value_width)      |
//! +----+---------+------------------+---------------------------+
//! ```
//!
//! The value field is always present for ops that carry a value and is
//! present for the remaining ops only when non-empty.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::protocol::key::{strip_padding, CacheKey, KEY_WIDTH};
use crate::protocol::opcode::Opcode;

/// Bytes before the value field: op (1) + seq (4) + key (16).
pub const HEADER_LEN: usize = 1 + 4 + KEY_WIDTH;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Message truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Key of {len} bytes exceeds the {max}-byte key field")]
    KeyTooLong { len: usize, max: usize },

    #[error("Value of {len} bytes exceeds the {max}-byte value field")]
    ValueTooLong { len: usize, max: usize },

    #[error("Unrecognized opcode {0}")]
    UnrecognizedOpcode(u8),
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub op: Opcode,
    pub seq: u32,
    pub key: CacheKey,
    /// Value content with padding stripped; empty when absent.
    pub value: Bytes,
}

impl WireMessage {
    pub fn new(op: Opcode, seq: u32, key: CacheKey, value: impl Into<Bytes>) -> Self {
        Self {
            op,
            seq,
            key,
            value: value.into(),
        }
    }

    /// A value-less message.
    pub fn bare(op: Opcode, seq: u32, key: CacheKey) -> Self {
        Self::new(op, seq, key, Bytes::new())
    }

    /// Reply to this message with the same seq and key.
    pub fn reply(&self, op: Opcode, value: impl Into<Bytes>) -> Self {
        Self::new(op, self.seq, self.key, value)
    }
}

/// Encoder/decoder for a deployment's value width.
#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    value_width: usize,
}

impl WireCodec {
    pub fn new(value_width: usize) -> Self {
        Self { value_width }
    }

    pub fn value_width(&self) -> usize {
        self.value_width
    }

    /// Full length of a message that carries the value field.
    pub fn full_len(&self) -> usize {
        HEADER_LEN + self.value_width
    }

    /// Encode from raw fields.
    pub fn encode(
        &self,
        op: Opcode,
        seq: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<Bytes, CodecError> {
        let key = CacheKey::from_bytes(key)?;
        self.encode_parts(op, seq, key, value)
    }

    /// Encode a message.
    pub fn encode_message(&self, msg: &WireMessage) -> Result<Bytes, CodecError> {
        self.encode_parts(msg.op, msg.seq, msg.key, &msg.value)
    }

    fn encode_parts(
        &self,
        op: Opcode,
        seq: u32,
        key: CacheKey,
        value: &[u8],
    ) -> Result<Bytes, CodecError> {
        if value.len() > self.value_width {
            return Err(CodecError::ValueTooLong {
                len: value.len(),
                max: self.value_width,
            });
        }

        let with_value = op.carries_value() || !value.is_empty();
        let len = if with_value { self.full_len() } else { HEADER_LEN };

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(op.into());
        buf.put_u32(seq);
        buf.put_slice(&key.to_wire());
        if with_value {
            buf.put_bytes(0, self.value_width - value.len());
            buf.put_slice(value);
        }
        Ok(buf.freeze())
    }

    /// Decode a message.
    pub fn decode(&self, bytes: &[u8]) -> Result<WireMessage, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                got: bytes.len(),
            });
        }

        let mut buf = bytes;
        let op = Opcode::try_from(buf.get_u8()).map_err(CodecError::UnrecognizedOpcode)?;
        let seq = buf.get_u32();
        let key = CacheKey::from_u128(buf.get_u128());

        // Optional-value ops carry either no value field or a complete one.
        let value = if buf.is_empty() && !op.carries_value() {
            Bytes::new()
        } else if buf.len() < self.value_width {
            return Err(CodecError::Truncated {
                needed: self.full_len(),
                got: bytes.len(),
            });
        } else {
            Bytes::copy_from_slice(strip_padding(&buf[..self.value_width]))
        };

        Ok(WireMessage {
            op,
            seq,
            key,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn codec() -> WireCodec {
        WireCodec::new(64)
    }

    fn all_opcodes() -> Vec<Opcode> {
        (0..=u8::MAX).filter_map(|c| Opcode::try_from(c).ok()).collect()
    }

    /// Byte strings of `1..=max` bytes with a non-zero first byte, which is
    /// the range the padding scheme can represent exactly.
    fn field(max: usize) -> impl Strategy<Value = Vec<u8>> {
        (1..=u8::MAX, prop::collection::vec(any::<u8>(), 0..max)).prop_map(|(head, tail)| {
            let mut bytes = vec![head];
            bytes.extend(tail);
            bytes
        })
    }

    fn assert_round_trip(c: &WireCodec, op: Opcode, seq: u32, key: &[u8], value: &[u8]) {
        let bytes = c.encode(op, seq, key, value).unwrap();
        let msg = c.decode(&bytes).unwrap();
        assert_eq!(msg.op, op);
        assert_eq!(msg.seq, seq);
        assert_eq!(msg.key.to_bytes(), key.to_vec(), "{op} key");
        assert_eq!(&msg.value[..], value, "{op} value");
    }

    #[test]
    fn test_round_trip_field_edges() {
        let c = codec();
        for op in all_opcodes() {
            for seq in [0, 1, u32::MAX] {
                for key_len in [1, 15, 16] {
                    let key = vec![0xA5; key_len];
                    if !op.carries_value() {
                        assert_round_trip(&c, op, seq, &key, b"");
                    }
                    for value_len in [1, 63, 64] {
                        assert_round_trip(&c, op, seq, &key, &vec![0x5A; value_len]);
                    }
                }
            }
        }
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            op in prop::sample::select(all_opcodes()),
            seq in any::<u32>(),
            key in field(16),
            value in prop::option::of(field(64)),
        ) {
            let c = codec();
            let value = value.unwrap_or_default();
            let bytes = c.encode(op, seq, &key, &value).unwrap();
            let msg = c.decode(&bytes).unwrap();
            prop_assert_eq!(msg.op, op);
            prop_assert_eq!(msg.seq, seq);
            prop_assert_eq!(msg.key.to_bytes(), key);
            prop_assert_eq!(&msg.value[..], &value[..]);
        }
    }

    #[test]
    fn test_round_trip_write() {
        let c = codec();
        let bytes = c.encode(Opcode::Write, 42, b"one", b"alpha").unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 64);

        let msg = c.decode(&bytes).unwrap();
        assert_eq!(msg.op, Opcode::Write);
        assert_eq!(msg.seq, 42);
        assert_eq!(msg.key.to_bytes(), b"one".to_vec());
        assert_eq!(&msg.value[..], b"alpha");
    }

    #[test]
    fn test_layout_is_big_endian_and_high_order_padded() {
        let c = WireCodec::new(8);
        let bytes = c.encode(Opcode::Write, 0x0102_0304, b"k", b"v").unwrap();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &[1, 2, 3, 4]);
        assert_eq!(&bytes[5..20], &[0u8; 15]);
        assert_eq!(bytes[20], b'k');
        assert_eq!(&bytes[21..28], &[0u8; 7]);
        assert_eq!(bytes[28], b'v');
    }

    #[test]
    fn test_read_request_has_no_value_field() {
        let c = codec();
        let bytes = c.encode(Opcode::Read, 1, b"one", b"").unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        let msg = c.decode(&bytes).unwrap();
        assert!(msg.value.is_empty());
    }

    #[test]
    fn test_read_reply_carries_value() {
        let c = codec();
        let bytes = c.encode(Opcode::Read, 1, b"one", b"alpha").unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 64);
        assert_eq!(&c.decode(&bytes).unwrap().value[..], b"alpha");
    }

    #[test]
    fn test_oversized_fields_fail() {
        let c = codec();
        assert!(matches!(
            c.encode(Opcode::Write, 0, &[b'k'; 17], b"v"),
            Err(CodecError::KeyTooLong { len: 17, max: 16 })
        ));
        assert!(matches!(
            c.encode(Opcode::Write, 0, b"k", &[b'v'; 65]),
            Err(CodecError::ValueTooLong { len: 65, max: 64 })
        ));
        assert!(c.encode(Opcode::Write, 0, &[b'k'; 16], &[b'v'; 64]).is_ok());
    }

    #[test]
    fn test_truncated() {
        let c = codec();
        assert_eq!(
            c.decode(&[0u8; 10]),
            Err(CodecError::Truncated { needed: 21, got: 10 })
        );

        // A write without its value field.
        let bytes = c.encode(Opcode::Write, 0, b"k", b"v").unwrap();
        assert!(matches!(
            c.decode(&bytes[..HEADER_LEN]),
            Err(CodecError::Truncated { .. })
        ));

        // A partial value field on an optional-value op.
        let bytes = c.encode(Opcode::Read, 0, b"k", b"v").unwrap();
        assert!(matches!(
            c.decode(&bytes[..HEADER_LEN + 3]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unrecognized_opcode() {
        let c = codec();
        let mut raw = c.encode(Opcode::Read, 0, b"k", b"").unwrap().to_vec();
        raw[0] = 99;
        assert_eq!(c.decode(&raw), Err(CodecError::UnrecognizedOpcode(99)));
    }

    #[test]
    fn test_value_carrying_op_with_empty_value() {
        let c = codec();
        let msg = WireMessage::bare(Opcode::UpdateComplete, 3, "ten".parse().unwrap());
        let bytes = c.encode_message(&msg).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 64);
        assert_eq!(c.decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_trailing_datagram_bytes_ignored() {
        let c = WireCodec::new(4);
        let mut raw = c.encode(Opcode::Write, 0, b"k", b"abcd").unwrap().to_vec();
        raw.extend_from_slice(&[0xff; 8]);
        assert_eq!(&c.decode(&raw).unwrap().value[..], b"abcd");
    }
}
