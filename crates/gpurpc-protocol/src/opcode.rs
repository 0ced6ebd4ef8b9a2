use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Opcodes issued by the device-side libc are tagged with `'c'` in the top byte.
pub const LIBC_OPCODE_BASE: u32 = (b'c' as u32) << 24;

/// Build a libc opcode from its index.
pub const fn libc_opcode(n: u32) -> u32 {
    LIBC_OPCODE_BASE | n
}

/// Remote operations a device program may request.
/// Only `Malloc` and `Free` are serviced by the bridge itself; the rest are
/// forwarded to the opcode delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Opcode {
    None = 0,
    WriteToStdout = libc_opcode(1),
    WriteToStderr = libc_opcode(2),
    WriteToStream = libc_opcode(3),
    WriteToStdoutNewline = libc_opcode(4),
    ReadFromStream = libc_opcode(5),
    ReadFgets = libc_opcode(6),
    OpenFile = libc_opcode(7),
    CloseFile = libc_opcode(8),
    Malloc = libc_opcode(9),
    Free = libc_opcode(10),
    HostCall = libc_opcode(11),
    Abort = libc_opcode(12),
}

impl Opcode {
    const ALL: [Opcode; 13] = [
        Opcode::None,
        Opcode::WriteToStdout,
        Opcode::WriteToStderr,
        Opcode::WriteToStream,
        Opcode::WriteToStdoutNewline,
        Opcode::ReadFromStream,
        Opcode::ReadFgets,
        Opcode::OpenFile,
        Opcode::CloseFile,
        Opcode::Malloc,
        Opcode::Free,
        Opcode::HostCall,
        Opcode::Abort,
    ];

    /// The raw value stored in a port header.
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Look up a known opcode. Unknown values are still valid on the wire and
    /// are handed to the delegate as raw integers.
    pub fn from_raw(raw: u32) -> Option<Opcode> {
        Self::ALL.iter().copied().find(|op| op.raw() == raw)
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::None => "none",
            Opcode::WriteToStdout => "write_to_stdout",
            Opcode::WriteToStderr => "write_to_stderr",
            Opcode::WriteToStream => "write_to_stream",
            Opcode::WriteToStdoutNewline => "write_to_stdout_newline",
            Opcode::ReadFromStream => "read_from_stream",
            Opcode::ReadFgets => "read_fgets",
            Opcode::OpenFile => "open_file",
            Opcode::CloseFile => "close_file",
            Opcode::Malloc => "malloc",
            Opcode::Free => "free",
            Opcode::HostCall => "host_call",
            Opcode::Abort => "abort",
        }
    }
}

/// Result of servicing one port, as reported by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Status {
    Success = 0x0,
    Error = 0x1000,
    UnhandledOpcode = 0x1001,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    pub fn from_raw(raw: u32) -> Result<Status, ProtocolError> {
        match raw {
            0x0 => Ok(Status::Success),
            0x1000 => Ok(Status::Error),
            0x1001 => Ok(Status::UnhandledOpcode),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}
