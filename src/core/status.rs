//! Result codes returned across the engine callback interface.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Standard result code.
///
/// Wire statuses carry their binary protocol value; the engine-only codes
/// (`WouldBlock`, `Disconnect`, `Failed`) never appear in a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    /// No stream for the addressed vbucket/opaque ("stream not found").
    KeyNotFound,
    KeyExists,
    TooBig,
    InvalidArgument,
    NotMyVbucket,
    /// Seqno outside the current snapshot.
    OutOfRange,
    Rollback,
    UnknownCommand,
    NotSupported,
    TempFail,
    WouldBlock,
    Disconnect,
    Failed,
}

impl Status {
    /// Binary protocol status, `None` for engine-only codes.
    pub fn wire_code(self) -> Option<u16> {
        match self {
            Status::Success => Some(0x00),
            Status::KeyNotFound => Some(0x01),
            Status::KeyExists => Some(0x02),
            Status::TooBig => Some(0x03),
            Status::InvalidArgument => Some(0x04),
            Status::NotMyVbucket => Some(0x07),
            Status::OutOfRange => Some(0x22),
            Status::Rollback => Some(0x23),
            Status::UnknownCommand => Some(0x81),
            Status::NotSupported => Some(0x83),
            Status::TempFail => Some(0x86),
            Status::WouldBlock | Status::Disconnect | Status::Failed => None,
        }
    }

    pub fn from_wire(code: u16) -> Option<Self> {
        let status = match code {
            0x00 => Status::Success,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x03 => Status::TooBig,
            0x04 => Status::InvalidArgument,
            0x07 => Status::NotMyVbucket,
            0x22 => Status::OutOfRange,
            0x23 => Status::Rollback,
            0x81 => Status::UnknownCommand,
            0x83 => Status::NotSupported,
            0x86 => Status::TempFail,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::KeyNotFound => "key_not_found",
            Status::KeyExists => "key_exists",
            Status::TooBig => "too_big",
            Status::InvalidArgument => "invalid_argument",
            Status::NotMyVbucket => "not_my_vbucket",
            Status::OutOfRange => "out_of_range",
            Status::Rollback => "rollback",
            Status::UnknownCommand => "unknown_command",
            Status::NotSupported => "not_supported",
            Status::TempFail => "temp_fail",
            Status::WouldBlock => "would_block",
            Status::Disconnect => "disconnect",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
