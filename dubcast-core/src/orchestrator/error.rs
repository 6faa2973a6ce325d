use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::PipelineError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("video rendition failed: {0}")]
    VideoRendition(#[source] PipelineError),
    #[error("work directory error: {0}")]
    Workspace(#[from] PipelineError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl OrchestratorError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        OrchestratorError::Validation(message.into())
    }
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;
