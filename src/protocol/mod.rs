//! Fixed-width binary wire protocol shared by switch, backend and clients.
//!
//! - [`opcode`]: operation codes carried in the first byte of every message
//! - [`key`]: key canonicalization (16-byte big-endian integer)
//! - [`codec`]: message encoding/decoding with high-order zero padding
//! - [`stream`]: reading a single message from a connection

pub mod codec;
pub mod key;
pub mod opcode;
pub mod stream;

pub use codec::{CodecError, WireCodec, WireMessage};
pub use key::CacheKey;
pub use opcode::Opcode;
