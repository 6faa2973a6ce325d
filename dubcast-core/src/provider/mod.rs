pub mod elevenlabs;
pub mod error;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ProviderSection;
use crate::events::{PipelineEvent, PipelineObserver, Stage};
use crate::language::Language;

pub use elevenlabs::ElevenLabsProvider;
pub use error::{DubFailure, ProviderError, ProviderResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Completed,
    Failed(Option<String>),
}

/// Decoded poll response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobState {
    pub job_id: String,
    pub status: JobStatus,
    pub target_languages: Vec<String>,
}

/// Third-party dubbing service.
#[async_trait]
pub trait DubbingProvider: Send + Sync {
    async fn submit(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        language: &Language,
    ) -> ProviderResult<String>;

    async fn poll(&self, job_id: &str) -> ProviderResult<JobState>;

    async fn fetch_audio(&self, job_id: &str, language: &Language) -> ProviderResult<Vec<u8>>;

    /// Muxed video output, when the provider offers it.
    async fn fetch_video(
        &self,
        _job_id: &str,
        _language: &Language,
    ) -> ProviderResult<Option<Vec<u8>>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn from_config(section: &ProviderSection) -> Self {
        Self {
            attempts: section.poll_attempts.max(1),
            interval: Duration::from_secs(section.poll_interval_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DubOptions {
    pub poll: PollPolicy,
    pub prefer_video: bool,
}

impl DubOptions {
    pub fn from_config(section: &ProviderSection) -> Self {
        Self {
            poll: PollPolicy::from_config(section),
            prefer_video: section.prefer_muxed_video,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 120,
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DubbedMedia {
    Audio(Vec<u8>),
    Video(Vec<u8>),
}

impl DubbedMedia {
    pub fn bytes(&self) -> &[u8] {
        match self {
            DubbedMedia::Audio(bytes) | DubbedMedia::Video(bytes) => bytes,
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            DubbedMedia::Audio(_) => "dubbed.mp3",
            DubbedMedia::Video(_) => "dubbed.mp4",
        }
    }
}

/// Submits one language, polls until the job settles and downloads the
/// result. Exhausting the poll policy is a timeout for this language only.
pub async fn dub_language(
    provider: &dyn DubbingProvider,
    audio: Vec<u8>,
    file_name: &str,
    asset_id: &str,
    language: &Language,
    options: DubOptions,
    observer: &dyn PipelineObserver,
) -> Result<DubbedMedia, DubFailure> {
    let failed = |stage: Stage| move |source: ProviderError| DubFailure { stage, source };

    observer.on_event(&PipelineEvent::stage(asset_id, Some(language), Stage::SubmitDub));
    let job_id = provider
        .submit(audio, file_name, language)
        .await
        .map_err(failed(Stage::SubmitDub))?;
    debug!(asset = asset_id, lang = %language, job = %job_id, "dubbing job created");

    observer.on_event(&PipelineEvent::stage(asset_id, Some(language), Stage::PollDub));
    wait_for_completion(provider, &job_id, options.poll)
        .await
        .map_err(failed(Stage::PollDub))?;

    observer.on_event(&PipelineEvent::stage(asset_id, Some(language), Stage::FetchDub));
    if options.prefer_video {
        match provider.fetch_video(&job_id, language).await {
            Ok(Some(video)) => return Ok(DubbedMedia::Video(video)),
            Ok(None) => {}
            Err(err) => {
                warn!(job = %job_id, lang = %language, error = %err, "muxed video unavailable; using audio");
            }
        }
    }
    let bytes = provider
        .fetch_audio(&job_id, language)
        .await
        .map_err(failed(Stage::FetchDub))?;
    Ok(DubbedMedia::Audio(bytes))
}

async fn wait_for_completion(
    provider: &dyn DubbingProvider,
    job_id: &str,
    policy: PollPolicy,
) -> ProviderResult<()> {
    for attempt in 1..=policy.attempts {
        let state = provider.poll(job_id).await?;
        match state.status {
            JobStatus::Completed => return Ok(()),
            JobStatus::Failed(reason) => {
                return Err(ProviderError::JobFailed {
                    job_id: job_id.to_string(),
                    reason: reason.unwrap_or_else(|| "unknown".to_string()),
                })
            }
            JobStatus::InProgress => {
                debug!(job = job_id, attempt, "dubbing in progress");
                if attempt < policy.attempts {
                    tokio::time::sleep(policy.interval).await;
                }
            }
        }
    }
    Err(ProviderError::Timeout {
        job_id: job_id.to_string(),
        attempts: policy.attempts,
    })
}
