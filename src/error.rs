//! Error taxonomy
//!
//! Three severities: startup failures end the process, protocol errors end
//! one session, command errors only fail the command that caused them.

use crate::window::WindowId;
use std::io;
use thiserror::Error;

/// The server could not come up. Never retried.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid display geometry: {0}")]
    Geometry(String),

    #[error("failed to allocate shared frame buffer ({size} bytes)")]
    SharedMemory {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Wire-level corruption. The offending session is torn down.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("connection closed mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    #[error("invalid property mode {0}")]
    InvalidMode(u8),

    #[error("region with {0} rectangles exceeds limit")]
    RegionTooLarge(u32),

    #[error("property value of {0} bytes exceeds limit")]
    PropertyTooLarge(u32),

    #[error("unexpected byte-order marker {0:#04x}")]
    ByteOrder(u8),
}

/// A well-formed command that cannot be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown window {0}")]
    UnknownWindow(WindowId),

    #[error("window {0} belongs to another session")]
    NotOwner(WindowId),

    #[error("window {window} has no property {key}")]
    UnknownProperty { window: WindowId, key: u32 },

    #[error("window {window} already has property {key}")]
    DuplicateProperty { window: WindowId, key: u32 },
}

impl CommandError {
    /// Error code carried by the `CommandFailed` event.
    pub fn code(&self) -> u8 {
        match self {
            CommandError::UnknownWindow(_) => 1,
            CommandError::NotOwner(_) => 2,
            CommandError::UnknownProperty { .. } => 3,
            CommandError::DuplicateProperty { .. } => 4,
        }
    }

    pub fn window(&self) -> WindowId {
        match *self {
            CommandError::UnknownWindow(w) | CommandError::NotOwner(w) => w,
            CommandError::UnknownProperty { window, .. }
            | CommandError::DuplicateProperty { window, .. } => window,
        }
    }
}

/// Why a session stopped.
#[derive(Debug, Error)]
pub enum SessionEnd {
    #[error("client disconnected")]
    Closed,

    #[error("server shutting down")]
    Shutdown,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SessionEnd {
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, SessionEnd::Protocol(_))
    }
}
