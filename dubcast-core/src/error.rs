use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read dubcast config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse dubcast config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("invalid dubcast config {path}: {field} {reason}")]
    Invalid {
        path: PathBuf,
        field: &'static str,
        reason: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
