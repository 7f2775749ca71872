use crate::protocol::{
    error::ProtocolError,
    session::{PogoSession, PogoSessionImpl},
};
use medlink_sdk::{DriverError, DriverResult};
use std::sync::Arc;
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

impl From<ProtocolError> for DriverError {
    /// Map protocol-level errors into the driver's `DriverError` domain.
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidPacket(_) | ProtocolError::ChecksumMismatch { .. } => {
                DriverError::CodecError(err.to_string())
            }
            ProtocolError::UnexpectedReply(_) => DriverError::ExecutionError(err.to_string()),
            ProtocolError::Timeout(d) => DriverError::Timeout(d),
            ProtocolError::Transport(msg) => DriverError::SessionError(msg),
            ProtocolError::Io(e) => DriverError::SessionError(e.to_string()),
        }
    }
}

/// Open the meter's serial port.
pub fn open_port(port: &str, baud_rate: u32) -> DriverResult<Arc<dyn PogoSession>> {
    let serial = tokio_serial::new(port, baud_rate)
        .open_native_async()
        .map_err(|e| DriverError::SessionError(format!("open {port}: {e}")))?;
    info!(port, baud_rate, "opened serial port");
    Ok(Arc::new(PogoSessionImpl::new(serial)))
}
