//! Error types for the rustyh4 daemon.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the daemon.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("HCI error: {0}")]
    Hci(#[from] rustyh4::HciError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not determine config directory")]
    ConfigDirNotFound,

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Controller did not complete HCI Reset within {0:?}")]
    ResetTimeout(Duration),
}

/// Convenience type alias for Results with `DaemonError`.
pub type Result<T> = std::result::Result<T, DaemonError>;
