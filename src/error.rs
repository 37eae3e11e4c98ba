use std::path::PathBuf;

use thiserror::Error;

/// settings could not be loaded, nothing has run yet
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("invalid device pattern '{pattern}'")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// fatal conditions that end a scanning run early
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no scanner matching '{pattern}' found after {attempts} power-on attempt(s)")]
    DeviceNotFound { pattern: String, attempts: u32 },
    #[error("capture failed on device {device}")]
    Capture {
        device: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("power controller failed to {action} outlet {outlet}")]
    PowerControl {
        action: &'static str,
        outlet: u8,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to persist image {path}")]
    Persist {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("scanner driver error while trying to {action}")]
    Driver {
        action: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("run state is inconsistent: {0}")]
    Bookkeeping(#[source] anyhow::Error),
}
