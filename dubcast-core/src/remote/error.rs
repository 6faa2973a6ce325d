use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("object store error for {key}: {message}")]
    Storage { key: String, message: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("missing api token at {0}")]
    MissingToken(PathBuf),
    #[error("remote configuration error: {0}")]
    Config(String),
}

impl RemoteError {
    pub(crate) fn storage(key: &str, message: impl Into<String>) -> Self {
        RemoteError::Storage {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;
