use std::path::PathBuf;

use thiserror::Error;

use crate::events::Stage;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("provider api key not configured")]
    MissingApiKey,
    #[error("failed to read api key at {path}: {source}")]
    KeyFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("dubbing job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },
    #[error("dubbing job {job_id} not finished after {attempts} polls")]
    Timeout { job_id: String, attempts: u32 },
}

/// A provider error tagged with the step that raised it.
#[derive(Debug, Error)]
#[error("{stage}: {source}")]
pub struct DubFailure {
    pub stage: Stage,
    #[source]
    pub source: ProviderError,
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;
