// Constants for the medlink modules

/// Configuration file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE_NAME: &str = "medlink.toml";

/// Prefix of environment overrides, e.g. `MEDLINK__MEDTRONIC__SERIAL_NUMBER`.
pub const ENV_PREFIX: &str = "MEDLINK";

/// Directory for JSON upload output when none is configured.
pub const OUTPUT_DIR: &str = "./uploads";

/// Directory holding per-device delta markers.
pub const STATE_DIR: &str = "./state";
