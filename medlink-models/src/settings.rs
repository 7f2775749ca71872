use config::{Config, Environment, File};
use medlink_error::MedlinkResult;
use medlink_sdk::RetryPolicy;
use serde::{self, Deserialize};
use std::{ops::Deref, sync::Arc};

use crate::constants::{ENV_PREFIX, OUTPUT_DIR, STATE_DIR};

#[derive(Debug, Clone)]
pub struct Settings(Arc<Inner>);

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    /// Load `config_path` (optional) and overlay `MEDLINK__SECTION__KEY`
    /// environment variables.
    pub fn new(config_path: String) -> MedlinkResult<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(config_path.as_str()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );
        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub medtronic: Medtronic,
    #[serde(default)]
    pub pogo: Pogo,
    #[serde(default)]
    pub retry: Retry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    #[serde(default = "General::log_level_default")]
    pub log_level: String,
    /// Minutes east of UTC applied to device clock readings.
    #[serde(default)]
    pub timezone_offset_minutes: i32,
    /// Reported with each upload session.
    #[serde(default = "General::timezone_name_default")]
    pub timezone_name: String,
    #[serde(default = "General::output_dir_default")]
    pub output_dir: String,
    #[serde(default = "General::state_dir_default")]
    pub state_dir: String,
}

impl Default for General {
    fn default() -> Self {
        General {
            log_level: General::log_level_default(),
            timezone_offset_minutes: 0,
            timezone_name: General::timezone_name_default(),
            output_dir: General::output_dir_default(),
            state_dir: General::state_dir_default(),
        }
    }
}

impl General {
    fn log_level_default() -> String {
        "info".into()
    }

    fn timezone_name_default() -> String {
        "UTC".into()
    }

    fn output_dir_default() -> String {
        OUTPUT_DIR.into()
    }

    fn state_dir_default() -> String {
        STATE_DIR.into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Medtronic {
    /// Serial port or hidraw node of the Contour Next Link.
    #[serde(default = "Medtronic::device_path_default")]
    pub device_path: String,
    /// Six digit pump serial number printed on the back of the pump.
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub group_id: String,
}

impl Default for Medtronic {
    fn default() -> Self {
        Medtronic {
            device_path: Medtronic::device_path_default(),
            serial_number: String::new(),
            group_id: String::new(),
        }
    }
}

impl Medtronic {
    fn device_path_default() -> String {
        "/dev/hidraw0".into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pogo {
    #[serde(default = "Pogo::port_default")]
    pub port: String,
    #[serde(default = "Pogo::baud_rate_default")]
    pub baud_rate: u32,
    #[serde(default)]
    pub group_id: String,
}

impl Default for Pogo {
    fn default() -> Self {
        Pogo {
            port: Pogo::port_default(),
            baud_rate: Pogo::baud_rate_default(),
            group_id: String::new(),
        }
    }
}

impl Pogo {
    fn port_default() -> String {
        "/dev/ttyUSB0".into()
    }

    fn baud_rate_default() -> u32 {
        19_200
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Retry {
    #[serde(default = "Retry::attempts_default")]
    pub attempts: u32,
    #[serde(default = "Retry::history_attempts_default")]
    pub history_attempts: u32,
    #[serde(default = "Retry::interval_ms_default")]
    pub interval_ms: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            attempts: Retry::attempts_default(),
            history_attempts: Retry::history_attempts_default(),
            interval_ms: Retry::interval_ms_default(),
        }
    }
}

impl Retry {
    fn attempts_default() -> u32 {
        RetryPolicy::default().attempts
    }

    fn history_attempts_default() -> u32 {
        RetryPolicy::history().attempts
    }

    fn interval_ms_default() -> u64 {
        RetryPolicy::default().interval_ms
    }

    /// Policy for single command reads.
    pub fn point_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            interval_ms: self.interval_ms,
        }
    }

    /// Policy for bulk history page reads.
    pub fn history_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.history_attempts,
            interval_ms: self.interval_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_config_file() {
        let settings = Settings::new("does-not-exist".into()).unwrap();
        assert_eq!(settings.general.log_level, "info");
        assert_eq!(settings.retry.point_policy(), RetryPolicy::default());
        assert_eq!(settings.retry.history_policy(), RetryPolicy::history());
        assert_eq!(settings.pogo.baud_rate, 19_200);
    }

    #[test]
    fn reads_toml_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[general]
timezone_offset_minutes = -300
output_dir = "/tmp/out"

[medtronic]
serial_number = "123456"
group_id = "g1"

[retry]
interval_ms = 20
"#
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();
        let settings = Settings::new(path).unwrap();
        assert_eq!(settings.general.timezone_offset_minutes, -300);
        assert_eq!(settings.general.output_dir, "/tmp/out");
        assert_eq!(settings.medtronic.serial_number, "123456");
        assert_eq!(settings.retry.point_policy().interval_ms, 20);
        assert_eq!(settings.retry.attempts, 5);
    }
}
