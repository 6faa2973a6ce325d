use std::path::PathBuf;

use chrono::Duration as ChronoDuration;
use serde::Serialize;

use crate::config::DubcastConfig;
use crate::events::Stage;
use crate::language::Language;
use crate::playlist::{VideoEntry, MASTER_PLAYLIST_NAME, VIDEO_PLAYLIST_PATH};
use crate::provider::DubOptions;

/// Caller input for one dubbing request. Languages stay raw strings until
/// validation so bad codes are reported before any side effect.
#[derive(Debug, Clone, Default)]
pub struct DubRequest {
    pub external_key: Option<String>,
    pub source: Option<String>,
    pub languages: Vec<String>,
}

impl DubRequest {
    pub fn new<I, S>(external_key: impl Into<String>, source: impl Into<String>, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            external_key: Some(external_key.into()),
            source: Some(source.into()),
            languages: languages.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LanguageOutcome {
    /// Produced by this run.
    Ready { url: String },
    /// Ready before this run started; nothing was dispatched.
    AlreadyReady { url: Option<String> },
    Failed { stage: Stage, reason: String },
    /// Another request owns the track right now.
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LanguageReport {
    pub language: Language,
    #[serde(flatten)]
    pub outcome: LanguageOutcome,
}

impl LanguageReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, LanguageOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    Partial,
    Failed,
}

/// Difference between the registry's ready set and the remote manifest
/// that was about to be replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManifestDrift {
    /// Ready in the registry, absent remotely.
    pub added: Vec<Language>,
    /// Listed remotely, not ready in the registry.
    pub removed: Vec<Language>,
}

impl ManifestDrift {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DubOutcome {
    pub asset_id: String,
    pub success: bool,
    pub status: RunStatus,
    pub languages: Vec<LanguageReport>,
    pub manifest_url: Option<String>,
    pub manifest_recovered: bool,
    pub drift: Option<ManifestDrift>,
    pub video_regenerated: bool,
    pub upload_error: Option<String>,
    pub invalidated: bool,
}

impl DubOutcome {
    pub fn report(&self, language: &Language) -> Option<&LanguageReport> {
        self.languages
            .iter()
            .find(|report| &report.language == language)
    }
}

/// Knobs the orchestrator reads from configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub work_dir: PathBuf,
    pub key_root: String,
    pub group_id: String,
    pub include_origin: bool,
    pub default_priority: Vec<Language>,
    pub playlist_version: u32,
    pub video_bandwidth: u64,
    pub video_resolution: String,
    pub video_codecs: String,
    pub force_regenerate_video: bool,
    pub max_parallel_languages: usize,
    pub stale_after: ChronoDuration,
    pub dub: DubOptions,
}

impl OrchestratorSettings {
    pub fn from_config(config: &DubcastConfig) -> Self {
        Self {
            work_dir: config.resolve_path(&config.paths.work_dir),
            key_root: config.storage.key_root.trim_matches('/').to_string(),
            group_id: config.playlist.group_id.clone(),
            include_origin: config.playlist.include_origin,
            default_priority: config.playlist.default_priority.clone(),
            playlist_version: config.playlist.version,
            video_bandwidth: config.playlist.video_bandwidth,
            video_resolution: config.playlist.video_resolution.clone(),
            video_codecs: config.playlist.video_codecs.clone(),
            force_regenerate_video: config.playlist.force_regenerate_video,
            max_parallel_languages: config.limits.max_parallel_languages.max(1),
            stale_after: ChronoDuration::minutes(config.registry.stale_processing_minutes as i64),
            dub: DubOptions::from_config(&config.provider),
        }
    }

    pub fn video_entry(&self) -> VideoEntry {
        VideoEntry {
            bandwidth: self.video_bandwidth,
            resolution: self.video_resolution.clone(),
            codecs: self.video_codecs.clone(),
            uri: VIDEO_PLAYLIST_PATH.to_string(),
            audio_group: self.group_id.clone(),
        }
    }

    /// `{key_root}/{key}/master.m3u8`
    pub fn manifest_key(&self, key: &str) -> String {
        let key = key.trim_matches('/');
        if self.key_root.is_empty() {
            format!("{key}/{}", MASTER_PLAYLIST_NAME)
        } else {
            format!("{}/{key}/{}", self.key_root, MASTER_PLAYLIST_NAME)
        }
    }
}
