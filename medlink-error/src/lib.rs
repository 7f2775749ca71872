use anyhow::Error as AnyhowError;
use config::ConfigError;
use medlink_sdk::DriverError;
use serde_json::Error as SerdeJsonError;
use std::{error::Error as StdError, io::Error as IoError};
use thiserror::Error;
use tokio::{task::JoinError, time::Duration};

pub type MedlinkResult<T, E = MedlinkError> = anyhow::Result<T, E>;

#[derive(Error, Debug, Default)]
pub enum MedlinkError {
    #[error("device unavailable")]
    #[default]
    DeviceUnavailable,
    #[error("read/write timeout")]
    Timeout(Duration),
    #[error("{0}")]
    JoinError(#[from] JoinError),
    #[error("{0}")]
    StdError(#[from] Box<dyn StdError + Send + Sync>),
    #[error("{0}")]
    IoError(#[from] IoError),
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Anyhow(#[from] AnyhowError),
    #[error("{0}")]
    Json(#[from] SerdeJsonError),
    #[error("{0}")]
    ConfigError(#[from] ConfigError),
    #[error("Driver error [{code}]: {source}")]
    Driver {
        code: &'static str,
        #[source]
        source: DriverError,
    },
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Initialization error: {0}")]
    InitializationError(String),
    #[error("Upload error: {0}")]
    UploadError(String),
}

impl From<String> for MedlinkError {
    #[inline]
    fn from(e: String) -> Self {
        MedlinkError::Msg(e)
    }
}

impl From<&str> for MedlinkError {
    #[inline]
    fn from(e: &str) -> Self {
        MedlinkError::Msg(e.to_string())
    }
}

impl From<DriverError> for MedlinkError {
    #[inline]
    fn from(e: DriverError) -> Self {
        MedlinkError::Driver {
            code: e.code(),
            source: e,
        }
    }
}

impl MedlinkError {
    /// Stable code for UI display; falls back to a generic code for
    /// errors that did not originate in a driver.
    pub fn code(&self) -> &'static str {
        match self {
            MedlinkError::Driver { code, .. } => code,
            MedlinkError::Timeout(_) => "E_TIMEOUT",
            MedlinkError::ConfigError(_) | MedlinkError::ConfigurationError(_) => "E_CONFIG",
            MedlinkError::UploadError(_) => "E_UPLOAD",
            _ => "E_UNKNOWN",
        }
    }
}
