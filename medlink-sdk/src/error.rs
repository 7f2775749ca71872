use std::time::Duration;
use thiserror::Error;

pub type DriverResult<T> = Result<T, DriverError>;

/// Driver specific errors
#[derive(Error, Debug, Default)]
pub enum DriverError {
    #[error("Device unavailable")]
    #[default]
    DeviceUnavailable,
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Execution error: {0}")]
    ExecutionError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Codec error: {0}")]
    CodecError(String),
    #[error("Read/Write timeout")]
    Timeout(Duration),
    #[error("Session error: {0}")]
    SessionError(String),
    #[error("Communication error: {0}")]
    CommunicationError(String),
    #[error("{message}")]
    UnsupportedDevice { message: String, code: &'static str },
    #[error("Decode error: {0}")]
    DecodeError(String),
    #[error("Simulation error: {0}")]
    SimulationError(String),
    #[error("{0}")]
    NoRecords(String),
    #[error("Upload error: {0}")]
    UploadError(String),
}

impl DriverError {
    /// Stable error code surfaced to the user interface.
    pub fn code(&self) -> &'static str {
        match self {
            DriverError::DeviceUnavailable => "E_DEVICE_UNAVAILABLE",
            DriverError::ValidationError(_) => "E_VALIDATION",
            DriverError::ExecutionError(_) => "E_PROTOCOL",
            DriverError::ConfigurationError(_) => "E_CONFIG",
            DriverError::CodecError(_) => "E_CODEC",
            DriverError::Timeout(_) => "E_TIMEOUT",
            DriverError::SessionError(_) => "E_SESSION",
            DriverError::CommunicationError(_) => "E_COMMUNICATION",
            DriverError::UnsupportedDevice { code, .. } => code,
            DriverError::DecodeError(_) => "E_DECODE",
            DriverError::SimulationError(_) => "E_SIMULATION",
            DriverError::NoRecords(_) => "E_NO_RECORDS",
            DriverError::UploadError(_) => "E_UPLOAD",
        }
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        DriverError::UploadError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_device_keeps_its_code() {
        let err = DriverError::UnsupportedDevice {
            message: "Unsupported pump model: 512".into(),
            code: "E_MEDTRONIC_UNSUPPORTED",
        };
        assert_eq!(err.code(), "E_MEDTRONIC_UNSUPPORTED");
        assert_eq!(err.to_string(), "Unsupported pump model: 512");
    }

    #[test]
    fn no_records_displays_message_verbatim() {
        let err = DriverError::NoRecords("No records found on pump".into());
        assert_eq!(err.to_string(), "No records found on pump");
        assert_eq!(err.code(), "E_NO_RECORDS");
    }
}
