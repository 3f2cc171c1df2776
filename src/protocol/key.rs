//! Key canonicalization.
//!
//! Keys are zero-padded on the high-order side to [`KEY_WIDTH`] bytes and
//! read as an unsigned big-endian integer. The same integer is the match key
//! of the switch lookup table and the input to any hash-based indexing, so
//! the switch, the backend and clients all agree on a key's identity.

use serde::{Deserialize, Serialize};

use crate::protocol::codec::CodecError;

/// Width of the key field on the wire, in bytes.
pub const KEY_WIDTH: usize = 16;

/// A canonical cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(u128);

impl CacheKey {
    /// Canonicalize raw key bytes. Fails if the key is wider than the field.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CodecError> {
        if raw.len() > KEY_WIDTH {
            return Err(CodecError::KeyTooLong {
                len: raw.len(),
                max: KEY_WIDTH,
            });
        }
        let mut padded = [0u8; KEY_WIDTH];
        padded[KEY_WIDTH - raw.len()..].copy_from_slice(raw);
        Ok(Self(u128::from_be_bytes(padded)))
    }

    /// Build a key from its big-endian integer encoding.
    pub fn from_u128(value: u128) -> Self {
        Self(value)
    }

    /// Big-endian integer encoding (lookup-table match key).
    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// Padded wire representation.
    pub fn to_wire(&self) -> [u8; KEY_WIDTH] {
        self.0.to_be_bytes()
    }

    /// Key content with the high-order zero padding stripped.
    pub fn to_bytes(&self) -> Vec<u8> {
        strip_padding(&self.to_wire()).to_vec()
    }
}

impl std::str::FromStr for CacheKey {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// Strip high-order zero padding.
pub fn strip_padding(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}
