use std::path::PathBuf;

use thiserror::Error;

use crate::events::Stage;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage}: failed to launch transcoder: {source}")]
    Spawn {
        stage: Stage,
        source: std::io::Error,
    },
    #[error("{stage}: transcoder exited with {status:?}: {stderr}")]
    Process {
        stage: Stage,
        status: Option<i32>,
        stderr: String,
    },
    #[error("{stage}: expected output {path} is missing")]
    MissingOutput { stage: Stage, path: PathBuf },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Spawn { stage, .. }
            | PipelineError::Process { stage, .. }
            | PipelineError::MissingOutput { stage, .. } => Some(*stage),
            PipelineError::Io { .. } => None,
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
