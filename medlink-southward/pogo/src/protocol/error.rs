use std::time::Duration;
use thiserror::Error;

pub const METER_TIMEOUT: &str = "Timeout error. Is the meter switched on?";

/// Protocol-level error type for the POGO link.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Response frame too short to hold a command and checksum.
    #[error("{0}")]
    InvalidPacket(String),
    #[error("Checksum mismatch")]
    ChecksumMismatch { expected: u16, received: u16 },
    /// First response character does not echo the command.
    #[error("Unexpected response")]
    UnexpectedReply(String),
    #[error("{METER_TIMEOUT}")]
    Timeout(Duration),
    #[error("POGO transport error: {0}")]
    Transport(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
