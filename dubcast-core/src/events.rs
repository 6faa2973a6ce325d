use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use crate::language::Language;
use crate::registry::TrackStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ExtractSource,
    SubmitDub,
    PollDub,
    FetchDub,
    DecodeAudio,
    Normalize,
    SegmentAudio,
    SegmentVideo,
    Registry,
    ManifestRebuild,
    Upload,
    Invalidate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ExtractSource => "extract_source",
            Stage::SubmitDub => "submit_dub",
            Stage::PollDub => "poll_dub",
            Stage::FetchDub => "fetch_dub",
            Stage::DecodeAudio => "decode_audio",
            Stage::Normalize => "normalize",
            Stage::SegmentAudio => "segment_audio",
            Stage::SegmentVideo => "segment_video",
            Stage::Registry => "registry",
            Stage::ManifestRebuild => "manifest_rebuild",
            Stage::Upload => "upload",
            Stage::Invalidate => "invalidate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress notifications, delivered before each external call and after
/// each registry transition, in execution order per language.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageStarted {
        asset_id: String,
        language: Option<Language>,
        stage: Stage,
    },
    TrackTransition {
        asset_id: String,
        language: Language,
        status: TrackStatus,
    },
    ManifestBuilt {
        asset_id: String,
        audio_tracks: usize,
    },
    Uploaded {
        asset_id: String,
        files: usize,
        bytes: u64,
    },
    Invalidated {
        asset_id: String,
        success: bool,
    },
}

impl PipelineEvent {
    pub fn stage(asset_id: &str, language: Option<&Language>, stage: Stage) -> Self {
        PipelineEvent::StageStarted {
            asset_id: asset_id.to_string(),
            language: language.cloned(),
            stage,
        }
    }

    pub fn transition(asset_id: &str, language: &Language, status: TrackStatus) -> Self {
        PipelineEvent::TrackTransition {
            asset_id: asset_id.to_string(),
            language: language.clone(),
            status,
        }
    }
}

pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Default observer: one `tracing` record per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StageStarted {
                asset_id,
                language,
                stage,
            } => {
                let lang = language.as_ref().map(Language::as_str).unwrap_or("-");
                info!(asset = %asset_id, lang, stage = %stage, "stage started");
            }
            PipelineEvent::TrackTransition {
                asset_id,
                language,
                status,
            } => info!(asset = %asset_id, lang = %language, status = %status, "track transition"),
            PipelineEvent::ManifestBuilt {
                asset_id,
                audio_tracks,
            } => info!(asset = %asset_id, audio_tracks, "manifest built"),
            PipelineEvent::Uploaded {
                asset_id,
                files,
                bytes,
            } => info!(asset = %asset_id, files, bytes, "bundle uploaded"),
            PipelineEvent::Invalidated { asset_id, success } => {
                info!(asset = %asset_id, success, "manifest invalidation")
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PipelineEvent::StageStarted { stage, .. } => Some(stage),
                _ => None,
            })
            .collect()
    }

    /// Stages seen for one language, in order.
    pub fn stages_for(&self, language: &Language) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PipelineEvent::StageStarted {
                    language: Some(lang),
                    stage,
                    ..
                } if &lang == language => Some(stage),
                _ => None,
            })
            .collect()
    }
}

impl PipelineObserver for RecordingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
