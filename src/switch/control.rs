//! The RPC surface used to mutate switch tables and registers.
//!
//! The crate treats the transport behind this trait as opaque: a Thrift or
//! P4Runtime binding implements [`SwitchControlPort`] and is injected into
//! the key directory and the measurement reset task.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Switch RPC failed: {0}")]
    Rpc(String),

    #[error("Unknown table {0}")]
    UnknownTable(String),

    #[error("Unknown register {0}")]
    UnknownRegister(String),

    #[error("Index {index} out of range for {name}")]
    IndexOutOfRange { name: String, index: u32 },
}

/// Handle of an installed table entry.
pub type EntryHandle = u64;

/// Parameters of a switch hash unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashConfig {
    pub name: String,
    pub polynomial: u32,
    pub initial: u32,
    pub final_xor: u32,
    pub reflect_input: bool,
    pub reflect_output: bool,
}

impl HashConfig {
    /// A CRC32 variant with the usual init/xor/reflection settings.
    pub fn crc32(name: &str, polynomial: u32) -> Self {
        Self {
            name: name.to_string(),
            polynomial,
            initial: 0xFFFF_FFFF,
            final_xor: 0xFFFF_FFFF,
            reflect_input: true,
            reflect_output: true,
        }
    }
}

#[async_trait]
pub trait SwitchControlPort: Send + Sync {
    /// Install an exact-match entry and return its handle.
    async fn add_table_entry(
        &self,
        table: &str,
        action: &str,
        match_fields: &[u128],
        action_params: &[u64],
    ) -> Result<EntryHandle, ControlError>;

    async fn delete_table_entry(&self, table: &str, handle: EntryHandle)
        -> Result<(), ControlError>;

    async fn write_register(&self, name: &str, index: u32, value: Bytes)
        -> Result<(), ControlError>;

    async fn read_register(&self, name: &str, index: u32) -> Result<Bytes, ControlError>;

    /// Clear every cell of a register array.
    async fn reset_register(&self, name: &str) -> Result<(), ControlError>;

    async fn read_counter(&self, name: &str, index: u32) -> Result<u64, ControlError>;

    async fn configure_hash(&self, params: &HashConfig) -> Result<(), ControlError>;
}

/// Shared handle to an injected control port.
pub type SharedControlPort = Arc<dyn SwitchControlPort>;
