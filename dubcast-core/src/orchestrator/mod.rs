pub mod error;
pub mod lock;
pub mod types;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::events::{PipelineEvent, PipelineObserver, Stage, TracingObserver};
use crate::language::Language;
use crate::pipeline::{ArtifactPipeline, StepContext, WorkLayout};
use crate::playlist::{audio_playlist_key, project_audio_entries, ManifestCodec, VIDEO_PLAYLIST_PATH};
use crate::provider::{dub_language, DubbingProvider};
use crate::registry::{MediaAsset, RegistryError, RegistryResult, SqliteTrackRegistry, TrackStatus};
use crate::remote::RemoteReconciler;

pub use error::{OrchestratorError, OrchestratorResult};
pub use lock::AssetLocks;
pub use types::{
    DubOutcome, DubRequest, LanguageOutcome, LanguageReport, ManifestDrift, OrchestratorSettings,
    RunStatus,
};

type StepFailure = (Stage, String);

/// Audio extracted once per run and shared by every language unit.
struct SourceAudio {
    path: PathBuf,
    bytes: Vec<u8>,
}

enum UnitInput<'a> {
    Source(&'a Result<SourceAudio, String>),
    /// Operator-supplied audio; the provider is not involved.
    File(&'a Path),
}

struct Reconciliation {
    manifest_url: Option<String>,
    recovered: bool,
    drift: Option<ManifestDrift>,
    upload_error: Option<String>,
    invalidated: bool,
}

/// Drives one asset from request to published manifest.
///
/// Language units run concurrently up to `max_parallel_languages` and fail
/// independently. After all units settle, the master playlist is rebuilt
/// from the registry's ready set, uploaded after every rendition, and the
/// CDN is asked to purge it.
pub struct Orchestrator {
    registry: SqliteTrackRegistry,
    remote: RemoteReconciler,
    provider: Arc<dyn DubbingProvider>,
    pipeline: ArtifactPipeline,
    codec: ManifestCodec,
    observer: Arc<dyn PipelineObserver>,
    locks: AssetLocks,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        registry: SqliteTrackRegistry,
        remote: RemoteReconciler,
        provider: Arc<dyn DubbingProvider>,
        pipeline: ArtifactPipeline,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            remote,
            provider,
            pipeline,
            codec: ManifestCodec::new(settings.playlist_version),
            observer: Arc::new(TracingObserver),
            locks: AssetLocks::new(),
            settings,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Shares manifest locks with other orchestrators in the process.
    pub fn with_locks(mut self, locks: AssetLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn registry(&self) -> &SqliteTrackRegistry {
        &self.registry
    }

    pub fn remote(&self) -> &RemoteReconciler {
        &self.remote
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub async fn dub(&self, request: &DubRequest) -> OrchestratorResult<DubOutcome> {
        let requested = parse_languages(&request.languages)?;
        let asset = self.resolve_asset(request)?;
        let asset_id = asset.asset_id.as_str();
        self.recover_stale(asset_id)?;

        let mut targets = requested;
        if self.settings.include_origin {
            targets.insert(0, Language::origin());
        }
        for language in &targets {
            self.registry.upsert_pending(asset_id, language)?;
        }

        let missing = self.registry.diff(asset_id, &targets)?;
        if missing.is_empty() && !self.registry.publish_pending(asset_id)? {
            info!(asset = asset_id, "requested languages already published");
            let languages = self.ready_reports(asset_id, Some(&targets))?;
            return Ok(DubOutcome {
                asset_id: asset.asset_id.clone(),
                success: true,
                status: RunStatus::Complete,
                languages,
                manifest_url: Some(self.remote.public_url(&asset.manifest_key)),
                manifest_recovered: false,
                drift: None,
                video_regenerated: false,
                upload_error: None,
                invalidated: false,
            });
        }

        let layout = WorkLayout::for_run(&self.settings.work_dir, asset_id);
        layout.create().await?;
        let result = self.dispatch(&asset, &targets, &missing, &layout).await;
        layout.cleanup().await;
        result
    }

    /// Rebuilds and republishes the master playlist from the registry
    /// without producing any rendition.
    pub async fn refresh_manifest(&self, reference: &str) -> OrchestratorResult<DubOutcome> {
        let asset = self.registry.lookup_asset(reference)?;
        self.recover_stale(&asset.asset_id)?;

        let layout = WorkLayout::for_run(&self.settings.work_dir, &asset.asset_id);
        layout.create().await?;
        let reconciled = self.reconcile(&asset, &layout).await;
        layout.cleanup().await;

        let carried = self.ready_reports(&asset.asset_id, None)?;
        Ok(self.summarize(&asset, carried, Vec::new(), reconciled?, false))
    }

    /// Publishes an operator-supplied audio file as `language`, skipping the
    /// provider but keeping the registry state machine.
    pub async fn ingest_audio(
        &self,
        reference: &str,
        language: &str,
        file: &Path,
    ) -> OrchestratorResult<DubOutcome> {
        let language: Language = language
            .parse()
            .map_err(|err: crate::language::UnsupportedLanguage| {
                OrchestratorError::Validation(err.to_string())
            })?;
        if language.is_origin() {
            return Err(OrchestratorError::validation(
                "the origin track is produced from the source",
            ));
        }
        match tokio::fs::metadata(file).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => {
                return Err(OrchestratorError::validation(format!(
                    "{} is not a readable file",
                    file.display()
                )))
            }
        }

        let asset = self.registry.lookup_asset(reference)?;
        let asset_id = asset.asset_id.as_str();
        self.recover_stale(asset_id)?;
        let track = self.registry.upsert_pending(asset_id, &language)?;
        if track.status == TrackStatus::Ready {
            return Err(OrchestratorError::validation(format!(
                "{language} is already ready for asset {asset_id}"
            )));
        }

        let layout = WorkLayout::for_run(&self.settings.work_dir, asset_id);
        layout.create().await?;
        let permits = Semaphore::new(1);
        let report = self
            .run_unit(&asset, &language, UnitInput::File(file), &layout, &permits)
            .await;
        let reconciled = self.reconcile(&asset, &layout).await;
        layout.cleanup().await;

        Ok(self.summarize(&asset, Vec::new(), vec![report], reconciled?, false))
    }

    async fn dispatch(
        &self,
        asset: &MediaAsset,
        targets: &[Language],
        missing: &[Language],
        layout: &WorkLayout,
    ) -> OrchestratorResult<DubOutcome> {
        let asset_id = asset.asset_id.as_str();
        let carried: Vec<LanguageReport> = self
            .ready_reports(asset_id, Some(targets))?
            .into_iter()
            .filter(|report| !missing.contains(&report.language))
            .collect();

        let mut video_regenerated = false;
        let mut dispatched = Vec::new();
        if !missing.is_empty() {
            video_regenerated = self.ensure_video(asset, layout).await?;
            let source = self.extract_source(asset, layout).await;
            if let Err(reason) = &source {
                warn!(asset = asset_id, error = %reason, "source audio extraction failed");
            }

            let permits = Semaphore::new(self.settings.max_parallel_languages.max(1));
            let units = missing.iter().map(|language| {
                self.run_unit(asset, language, UnitInput::Source(&source), layout, &permits)
            });
            dispatched = join_all(units).await;
        }

        let reconciled = self.reconcile(asset, layout).await?;
        Ok(self.summarize(asset, carried, dispatched, reconciled, video_regenerated))
    }

    async fn ensure_video(&self, asset: &MediaAsset, layout: &WorkLayout) -> OrchestratorResult<bool> {
        let key = format!("{}{VIDEO_PLAYLIST_PATH}", asset.key_prefix());
        if !self.settings.force_regenerate_video && self.remote.exists(&key).await {
            debug!(asset = %asset.asset_id, key, "video rendition already published");
            return Ok(false);
        }
        let ctx = StepContext {
            asset_id: &asset.asset_id,
            language: None,
            observer: self.observer.as_ref(),
        };
        self.pipeline
            .package_video(ctx, &asset.source_url, &layout.video_dir())
            .await
            .map_err(OrchestratorError::VideoRendition)?;
        Ok(true)
    }

    async fn extract_source(
        &self,
        asset: &MediaAsset,
        layout: &WorkLayout,
    ) -> Result<SourceAudio, String> {
        let ctx = StepContext {
            asset_id: &asset.asset_id,
            language: None,
            observer: self.observer.as_ref(),
        };
        let path = self
            .pipeline
            .extract_source_audio(ctx, &asset.source_url, &layout.source_scratch())
            .await
            .map_err(|err| err.to_string())?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
        Ok(SourceAudio { path, bytes })
    }

    async fn run_unit(
        &self,
        asset: &MediaAsset,
        language: &Language,
        input: UnitInput<'_>,
        layout: &WorkLayout,
        permits: &Semaphore,
    ) -> LanguageReport {
        let outcome = match permits.acquire().await {
            Ok(_permit) => self.run_language(asset, language, input, layout).await,
            Err(_) => LanguageOutcome::Skipped {
                reason: "dispatch closed".into(),
            },
        };
        LanguageReport {
            language: language.clone(),
            outcome,
        }
    }

    async fn run_language(
        &self,
        asset: &MediaAsset,
        language: &Language,
        input: UnitInput<'_>,
        layout: &WorkLayout,
    ) -> LanguageOutcome {
        let asset_id = asset.asset_id.as_str();
        match self.claim(asset_id, language) {
            Ok(()) => {}
            Err(RegistryError::InvalidTransition { from, .. }) => {
                info!(asset = asset_id, lang = %language, status = %from, "track owned elsewhere; skipping");
                return LanguageOutcome::Skipped {
                    reason: format!("track is {from}"),
                };
            }
            Err(err) => {
                return LanguageOutcome::Failed {
                    stage: Stage::Registry,
                    reason: err.to_string(),
                }
            }
        }

        match self.produce(asset, language, input, layout).await {
            Ok(()) => self.settle_ready(asset, language, layout).await,
            Err((stage, reason)) => {
                layout.discard(&layout.audio_dir(language)).await;
                self.settle_failed(asset_id, language, stage, reason)
            }
        }
    }

    /// pending -> processing; a failed row is retried first.
    fn claim(&self, asset_id: &str, language: &Language) -> RegistryResult<()> {
        let current = self.registry.fetch_track(asset_id, language)?;
        if matches!(current, Some(track) if track.status == TrackStatus::Failed) {
            self.registry.retry(asset_id, language)?;
            self.notify(asset_id, language, TrackStatus::Pending);
        }
        self.registry.mark_processing(asset_id, language)?;
        self.notify(asset_id, language, TrackStatus::Processing);
        Ok(())
    }

    async fn produce(
        &self,
        asset: &MediaAsset,
        language: &Language,
        input: UnitInput<'_>,
        layout: &WorkLayout,
    ) -> Result<(), StepFailure> {
        let scratch = layout.scratch(language);
        let audio = match input {
            UnitInput::File(path) => path.to_path_buf(),
            UnitInput::Source(Err(reason)) => return Err((Stage::ExtractSource, reason.clone())),
            UnitInput::Source(Ok(source)) if language.is_origin() => source.path.clone(),
            UnitInput::Source(Ok(source)) => {
                self.fetch_dub(&asset.asset_id, language, source, &scratch)
                    .await?
            }
        };

        let ctx = StepContext {
            asset_id: &asset.asset_id,
            language: Some(language),
            observer: self.observer.as_ref(),
        };
        self.pipeline
            .package_audio(ctx, &audio, &scratch, &layout.audio_dir(language))
            .await
            .map(|_| ())
            .map_err(|err| (err.stage().unwrap_or(Stage::SegmentAudio), err.to_string()))
    }

    async fn fetch_dub(
        &self,
        asset_id: &str,
        language: &Language,
        source: &SourceAudio,
        scratch: &Path,
    ) -> Result<PathBuf, StepFailure> {
        let file_name = source
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("source.m4a");
        let media = dub_language(
            self.provider.as_ref(),
            source.bytes.clone(),
            file_name,
            asset_id,
            language,
            self.settings.dub,
            self.observer.as_ref(),
        )
        .await
        .map_err(|err| (err.stage, err.source.to_string()))?;

        let path = scratch.join(media.file_name());
        let written = async {
            tokio::fs::create_dir_all(scratch).await?;
            tokio::fs::write(&path, media.bytes()).await
        };
        written
            .await
            .map_err(|err| (Stage::FetchDub, format!("failed to write {}: {err}", path.display())))?;
        Ok(path)
    }

    async fn settle_ready(
        &self,
        asset: &MediaAsset,
        language: &Language,
        layout: &WorkLayout,
    ) -> LanguageOutcome {
        let key = format!("{}{}", asset.key_prefix(), audio_playlist_key(language));
        let url = self.remote.public_url(&key);
        match self.registry.mark_ready(&asset.asset_id, language, &url) {
            Ok(_) => {
                self.notify(&asset.asset_id, language, TrackStatus::Ready);
                LanguageOutcome::Ready { url }
            }
            Err(err) => {
                warn!(asset = %asset.asset_id, lang = %language, error = %err, "could not mark track ready");
                layout.discard(&layout.audio_dir(language)).await;
                LanguageOutcome::Failed {
                    stage: Stage::Registry,
                    reason: err.to_string(),
                }
            }
        }
    }

    fn settle_failed(
        &self,
        asset_id: &str,
        language: &Language,
        stage: Stage,
        reason: String,
    ) -> LanguageOutcome {
        warn!(asset = asset_id, lang = %language, stage = %stage, error = %reason, "language failed");
        match self.registry.mark_failed(asset_id, language, &reason) {
            Ok(_) => self.notify(asset_id, language, TrackStatus::Failed),
            Err(err) => {
                warn!(asset = asset_id, lang = %language, error = %err, "could not record failure")
            }
        }
        LanguageOutcome::Failed { stage, reason }
    }

    /// Rebuilds the master from the registry and publishes the bundle.
    /// Holds the asset lock from the registry read until the upload ends.
    async fn reconcile(
        &self,
        asset: &MediaAsset,
        layout: &WorkLayout,
    ) -> OrchestratorResult<Reconciliation> {
        let asset_id = asset.asset_id.as_str();
        let _guard = self.locks.acquire(asset_id).await;

        self.observer
            .on_event(&PipelineEvent::stage(asset_id, None, Stage::ManifestRebuild));
        let ready: Vec<Language> = self
            .registry
            .list_ready(asset_id)?
            .into_iter()
            .map(|track| track.language)
            .collect();
        let entries = project_audio_entries(
            &ready,
            &self.settings.group_id,
            &self.settings.default_priority,
        );
        let manifest = self
            .codec
            .build(Some(&self.settings.video_entry()), &entries);
        let (recovered, drift) = self.inspect_remote(asset, &ready).await;

        let master = layout.master_path();
        tokio::fs::write(&master, manifest.as_bytes())
            .await
            .map_err(|source| OrchestratorError::Io {
                path: master.clone(),
                source,
            })?;
        self.observer.on_event(&PipelineEvent::ManifestBuilt {
            asset_id: asset_id.to_string(),
            audio_tracks: entries.len(),
        });

        self.observer
            .on_event(&PipelineEvent::stage(asset_id, None, Stage::Upload));
        let report = match self
            .remote
            .upload_tree(&layout.bundle(), &asset.key_prefix())
            .await
        {
            Ok(report) => report,
            Err(err) => {
                warn!(asset = asset_id, error = %err, "upload failed; manifest not published");
                return Ok(Reconciliation {
                    manifest_url: None,
                    recovered,
                    drift,
                    upload_error: Some(err.to_string()),
                    invalidated: false,
                });
            }
        };
        self.observer.on_event(&PipelineEvent::Uploaded {
            asset_id: asset_id.to_string(),
            files: report.files,
            bytes: report.bytes,
        });
        self.registry.mark_published(asset_id, &ready)?;

        self.observer
            .on_event(&PipelineEvent::stage(asset_id, None, Stage::Invalidate));
        let invalidated = self.remote.invalidate(&asset.manifest_key).await;
        self.observer.on_event(&PipelineEvent::Invalidated {
            asset_id: asset_id.to_string(),
            success: invalidated,
        });

        Ok(Reconciliation {
            manifest_url: Some(self.remote.public_url(&asset.manifest_key)),
            recovered,
            drift,
            upload_error: None,
            invalidated,
        })
    }

    /// Reads the published manifest for drift reporting only. The rebuilt
    /// manifest never depends on it.
    async fn inspect_remote(
        &self,
        asset: &MediaAsset,
        ready: &[Language],
    ) -> (bool, Option<ManifestDrift>) {
        let existing = match self.remote.fetch_manifest(&asset.manifest_key).await {
            Ok(Some(text)) => text,
            Ok(None) => return (false, None),
            Err(err) => {
                warn!(asset = %asset.asset_id, error = %err, "could not read published manifest");
                return (false, None);
            }
        };
        match self.codec.parse(&existing) {
            Ok(parsed) => {
                let remote = parsed.languages();
                let local: BTreeSet<Language> = ready.iter().cloned().collect();
                let drift = ManifestDrift {
                    added: local.difference(&remote).cloned().collect(),
                    removed: remote.difference(&local).cloned().collect(),
                };
                if !drift.is_empty() {
                    info!(asset = %asset.asset_id, added = ?drift.added, removed = ?drift.removed, "published manifest differs from registry");
                }
                (false, Some(drift))
            }
            Err(err) => {
                warn!(asset = %asset.asset_id, error = %err, "published manifest is corrupt; replacing it");
                (true, None)
            }
        }
    }

    fn recover_stale(&self, asset_id: &str) -> OrchestratorResult<()> {
        let cutoff = Utc::now() - self.settings.stale_after;
        for language in self.registry.fail_stale(asset_id, cutoff)? {
            warn!(asset = asset_id, lang = %language, "stale processing track failed");
            self.notify(asset_id, &language, TrackStatus::Failed);
        }
        Ok(())
    }

    /// Ready tracks as `AlreadyReady` reports, optionally restricted to `only`.
    fn ready_reports(
        &self,
        asset_id: &str,
        only: Option<&[Language]>,
    ) -> OrchestratorResult<Vec<LanguageReport>> {
        let ready: HashMap<Language, Option<String>> = self
            .registry
            .list_ready(asset_id)?
            .into_iter()
            .map(|track| (track.language, track.url))
            .collect();
        let mut reports: Vec<LanguageReport> = ready
            .into_iter()
            .filter(|(language, _)| only.map_or(true, |only| only.contains(language)))
            .map(|(language, url)| LanguageReport {
                language,
                outcome: LanguageOutcome::AlreadyReady { url },
            })
            .collect();
        sort_reports(&mut reports);
        Ok(reports)
    }

    fn resolve_asset(&self, request: &DubRequest) -> OrchestratorResult<MediaAsset> {
        let key = request
            .external_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty());
        let source = request
            .source
            .as_deref()
            .map(str::trim)
            .filter(|source| !source.is_empty());

        if let Some(key) = key {
            validate_key(key)?;
            if let Some(asset) = self.registry.find_asset_by_key(key)? {
                if source.is_some_and(|source| source != asset.source_url) {
                    warn!(asset = %asset.asset_id, "request source differs from the registered one; keeping registered source");
                }
                return Ok(asset);
            }
        }

        let source = source
            .ok_or_else(|| OrchestratorError::validation("a source is required for a new asset"))?;
        let source = validate_source(source)?;
        let asset_id = Uuid::new_v4().simple().to_string();
        let manifest_key = self.settings.manifest_key(key.unwrap_or(&asset_id));
        let asset = MediaAsset::new(asset_id, key.map(str::to_string), source, manifest_key);
        Ok(self.registry.find_or_create_asset(&asset)?)
    }

    fn summarize(
        &self,
        asset: &MediaAsset,
        carried: Vec<LanguageReport>,
        dispatched: Vec<LanguageReport>,
        reconciled: Reconciliation,
        video_regenerated: bool,
    ) -> DubOutcome {
        let all_failed = !dispatched.is_empty() && dispatched.iter().all(LanguageReport::is_failed);
        let any_failed = dispatched.iter().any(LanguageReport::is_failed);
        let success = reconciled.upload_error.is_none() && !all_failed;
        let status = if !success {
            RunStatus::Failed
        } else if any_failed {
            RunStatus::Partial
        } else {
            RunStatus::Complete
        };

        let mut languages = carried;
        languages.extend(dispatched);
        sort_reports(&mut languages);

        DubOutcome {
            asset_id: asset.asset_id.clone(),
            success,
            status,
            languages,
            manifest_url: reconciled.manifest_url,
            manifest_recovered: reconciled.recovered,
            drift: reconciled.drift,
            video_regenerated,
            upload_error: reconciled.upload_error,
            invalidated: reconciled.invalidated,
        }
    }

    fn notify(&self, asset_id: &str, language: &Language, status: TrackStatus) {
        self.observer
            .on_event(&PipelineEvent::transition(asset_id, language, status));
    }
}

/// Validates and normalises requested codes: sorted, deduplicated, origin
/// excluded.
fn parse_languages(raw: &[String]) -> OrchestratorResult<Vec<Language>> {
    if raw.is_empty() {
        return Err(OrchestratorError::validation(
            "at least one target language is required",
        ));
    }
    let mut languages = BTreeSet::new();
    for code in raw {
        let language: Language = code
            .parse()
            .map_err(|err: crate::language::UnsupportedLanguage| {
                OrchestratorError::Validation(err.to_string())
            })?;
        if language.is_origin() {
            return Err(OrchestratorError::validation(
                "the origin track is produced from the source and cannot be requested",
            ));
        }
        languages.insert(language);
    }
    Ok(languages.into_iter().collect())
}

fn validate_key(key: &str) -> OrchestratorResult<()> {
    let valid = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !key.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::validation(format!(
            "external key {key:?} may only contain letters, digits, '-', '_' and '.'"
        )))
    }
}

/// Accepts http(s) and file URLs, or a path that exists locally. Local
/// paths are stored absolute so later runs do not depend on the caller's
/// working directory.
fn validate_source(source: &str) -> OrchestratorResult<String> {
    if let Ok(url) = Url::parse(source) {
        if matches!(url.scheme(), "http" | "https" | "file") && (url.has_host() || url.scheme() == "file") {
            return Ok(source.to_string());
        }
    }
    if let Ok(path) = std::fs::canonicalize(source) {
        return Ok(path.to_string_lossy().into_owned());
    }
    Err(OrchestratorError::validation(format!(
        "source {source:?} is neither a URL nor an existing file"
    )))
}

fn sort_reports(reports: &mut [LanguageReport]) {
    reports.sort_by(|a, b| {
        (!a.language.is_origin(), &a.language).cmp(&(!b.language.is_origin(), &b.language))
    });
}
