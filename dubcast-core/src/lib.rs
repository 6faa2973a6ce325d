pub mod config;
pub mod error;
pub mod events;
pub mod language;
pub mod orchestrator;
pub mod pipeline;
pub mod playlist;
pub mod provider;
pub mod registry;
pub mod remote;
pub mod sqlite;

pub use config::{load_dubcast_config, DubcastConfig};
pub use error::{ConfigError, Result};
pub use events::{PipelineEvent, PipelineObserver, RecordingObserver, Stage, TracingObserver};
pub use language::{Language, UnsupportedLanguage, ORIGIN, SUPPORTED_LANGUAGES};
pub use orchestrator::{
    AssetLocks, DubOutcome, DubRequest, LanguageOutcome, LanguageReport, ManifestDrift,
    Orchestrator, OrchestratorError, OrchestratorResult, OrchestratorSettings, RunStatus,
};
pub use pipeline::{
    ArtifactPipeline, PipelineError, PipelineResult, SystemTranscodeExecutor, TranscodeExecutor,
    TranscodeProfile, WorkLayout,
};
pub use playlist::{AudioEntry, ManifestCodec, ParsedManifest, PlaylistError, VideoEntry};
pub use provider::{
    DubFailure, DubOptions, DubbingProvider, ElevenLabsProvider, JobState, JobStatus, PollPolicy,
    ProviderError,
};
pub use registry::{
    DubTrack, MediaAsset, RegistryError, SqliteTrackRegistry, TrackEvent, TrackStatus,
};
pub use remote::{
    CachePolicy, CdnInvalidator, HttpCdnPurger, MemoryObjectStore, NoopInvalidator, ObjectStore,
    RecordingInvalidator, RemoteError, RemoteReconciler, S3ObjectStore,
};
