use crate::protocol::{
    error::ProtocolError,
    session::{MedtronicSession, MedtronicSessionImpl, SessionConfig},
};
use medlink_sdk::{DriverError, DriverResult};
use std::sync::Arc;
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

/// Baud rate used when the link is exposed as a serial port.
const LINK_BAUD_RATE: u32 = 115_200;

impl From<ProtocolError> for DriverError {
    /// Map protocol-level errors into the driver's `DriverError` domain.
    ///
    /// - Structural issues are treated as `CodecError`.
    /// - Replies the exchange did not expect are `ExecutionError`.
    /// - Pages the pump stopped sending are `CommunicationError`.
    /// - Timeouts are mapped to `Timeout`, preserving the duration.
    /// - Transport/IO failures are mapped to `SessionError`.
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidPacket(_) | ProtocolError::ChecksumMismatch(_) => {
                DriverError::CodecError(err.to_string())
            }
            ProtocolError::Nak(_) | ProtocolError::UnexpectedReply(_) | ProtocolError::FewerPackets => {
                DriverError::ExecutionError(err.to_string())
            }
            ProtocolError::UnsupportedModel { ref model, code } => DriverError::UnsupportedDevice {
                message: format!("Unsupported pump model: {model}"),
                code,
            },
            ProtocolError::Communication(msg) => DriverError::CommunicationError(msg),
            ProtocolError::Timeout(d) => DriverError::Timeout(d),
            ProtocolError::Transport(msg) => DriverError::SessionError(msg),
            ProtocolError::Io(e) => DriverError::SessionError(e.to_string()),
        }
    }
}

/// Open the Contour Next Link at `device_path`.
///
/// `hidraw` nodes are opened as plain files; anything else is treated as a
/// serial port.
pub async fn open_link(
    device_path: &str,
    config: SessionConfig,
) -> DriverResult<Arc<dyn MedtronicSession>> {
    if device_path.contains("hidraw") {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .await
            .map_err(|e| DriverError::SessionError(format!("open {device_path}: {e}")))?;
        info!(device_path, "opened HID link");
        return Ok(Arc::new(MedtronicSessionImpl::new(file, config)));
    }

    let serial = tokio_serial::new(device_path, LINK_BAUD_RATE)
        .open_native_async()
        .map_err(|e| DriverError::SessionError(e.to_string()))?;
    info!(device_path, "opened serial link");
    Ok(Arc::new(MedtronicSessionImpl::new(serial, config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unsupported_model_keeps_code() {
        let err: DriverError = ProtocolError::unsupported_model("512").into();
        assert_eq!(err.code(), "E_MEDTRONIC_UNSUPPORTED");
        assert_eq!(err.to_string(), "Unsupported pump model: 512");
    }

    #[test]
    fn communication_errors_surface_verbatim() {
        let err: DriverError = ProtocolError::communication().into();
        assert_eq!(err.code(), "E_COMMUNICATION");
        assert!(err.to_string().contains("Please try to upload again."));
    }

    #[test]
    fn timeouts_keep_duration() {
        let err: DriverError = ProtocolError::Timeout(Duration::from_secs(5)).into();
        assert!(matches!(err, DriverError::Timeout(d) if d == Duration::from_secs(5)));
    }
}
