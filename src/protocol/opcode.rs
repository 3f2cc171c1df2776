//! Operation codes.

use serde::{Deserialize, Serialize};

/// Operation code carried in the first byte of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Read = 0,
    Write = 1,
    Delete = 2,
    HotRead = 3,
    UpdateComplete = 4,
    DeleteComplete = 5,
    CoherentUpdate = 6,
    UpdateCompleteAck = 7,
    RequestSuccess = 10,
    KeyNotFound = 20,
    MetricsReport = 30,
}

impl Opcode {
    /// Ops whose value field is always on the wire, even when empty.
    pub fn carries_value(&self) -> bool {
        matches!(
            self,
            Opcode::Write | Opcode::UpdateComplete | Opcode::CoherentUpdate
        )
    }

    /// Whether this op is a read that may bypass the coherency queue.
    pub fn is_read(&self) -> bool {
        matches!(self, Opcode::Read)
    }

    /// Stable lowercase name, used for log fields and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Read => "read",
            Opcode::Write => "write",
            Opcode::Delete => "delete",
            Opcode::HotRead => "hot_read",
            Opcode::UpdateComplete => "update_complete",
            Opcode::DeleteComplete => "delete_complete",
            Opcode::CoherentUpdate => "coherent_update",
            Opcode::UpdateCompleteAck => "update_complete_ack",
            Opcode::RequestSuccess => "request_success",
            Opcode::KeyNotFound => "key_not_found",
            Opcode::MetricsReport => "metrics_report",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        let op = match code {
            0 => Opcode::Read,
            1 => Opcode::Write,
            2 => Opcode::Delete,
            3 => Opcode::HotRead,
            4 => Opcode::UpdateComplete,
            5 => Opcode::DeleteComplete,
            6 => Opcode::CoherentUpdate,
            7 => Opcode::UpdateCompleteAck,
            10 => Opcode::RequestSuccess,
            20 => Opcode::KeyNotFound,
            30 => Opcode::MetricsReport,
            other => return Err(other),
        };
        Ok(op)
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> Self {
        op as u8
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}
