use std::time::Duration;
use thiserror::Error;

/// Stable code surfaced when the pump reports a model this driver cannot read.
pub const E_MEDTRONIC_UNSUPPORTED: &str = "E_MEDTRONIC_UNSUPPORTED";

pub const COMMUNICATION_ERROR: &str = "Communication error. Please try to upload again.";

/// Protocol-level error type for the Medtronic link.
///
/// Used inside the protocol module only; the supervisor maps it onto
/// [`medlink_sdk::DriverError`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A HID report without the `ABC` magic or with an unusable layout.
    #[error("{0}")]
    InvalidPacket(String),
    /// LSB sum of a pump reply does not match its header checksum.
    #[error("{0}")]
    ChecksumMismatch(String),
    /// The link set a non-zero NAK byte on the first packet of a reply.
    #[error("{0}")]
    Nak(String),
    /// No complete reply before the deadline.
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),
    /// Transport failure (connection closed, broken pipe).
    #[error("Medtronic transport error: {0}")]
    Transport(String),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Reply was well formed but not the one the exchange requires.
    #[error("{0}")]
    UnexpectedReply(String),
    /// The pump answered READ_MODEL with a model outside the supported list.
    #[error("Unsupported pump model: {model}")]
    UnsupportedModel { model: String, code: &'static str },
    /// Pump stopped answering in the middle of a page.
    #[error("{0}")]
    Communication(String),
    /// A page ended before all expected parts arrived.
    #[error("Fewer packets received than expected.")]
    FewerPackets,
}

impl ProtocolError {
    pub fn unsupported_model(model: impl Into<String>) -> Self {
        ProtocolError::UnsupportedModel {
            model: model.into(),
            code: E_MEDTRONIC_UNSUPPORTED,
        }
    }

    pub fn communication() -> Self {
        ProtocolError::Communication(COMMUNICATION_ERROR.to_string())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout(_))
    }
}
