use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;

use dubcast_core::orchestrator::{
    DubOutcome, DubRequest, LanguageOutcome, Orchestrator, OrchestratorError,
    OrchestratorSettings,
};
use dubcast_core::pipeline::{ArtifactPipeline, TranscodeProfile};
use dubcast_core::playlist::{AudioEntry, ManifestCodec, PlaylistError};
use dubcast_core::provider::elevenlabs::API_KEY_ENV;
use dubcast_core::provider::{ElevenLabsProvider, ProviderError};
use dubcast_core::registry::{
    DubTrack, MediaAsset, RegistryError, SqliteTrackRegistry, TrackEvent,
};
use dubcast_core::remote::{
    CachePolicy, CdnInvalidator, HttpCdnPurger, MemoryObjectStore, NoopInvalidator, ObjectStore,
    RecordingInvalidator, RemoteError, RemoteReconciler, S3ObjectStore,
};
use dubcast_core::{load_dubcast_config, DubcastConfig, Language};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] dubcast_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("{0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("manifest error: {0}")]
    Playlist(#[from] PlaylistError),
    #[error("storage error: {0}")]
    Remote(#[from] RemoteError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("authentication failed")]
    Authentication,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Unsuccessful(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Dubcast HLS dubbing control interface", long_about = None)]
pub struct Cli {
    /// Path to dubcast.toml
    #[arg(long, default_value = "configs/dubcast.toml")]
    pub config: PathBuf,
    /// Overrides paths.data_dir
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Overrides the registry database location
    #[arg(long)]
    pub registry_db: Option<PathBuf>,
    /// Local authentication token (required when DUBCASTCTL_TOKEN is set)
    #[arg(long)]
    pub token: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Dubs a section into the requested languages and publishes the bundle
    Dub(DubArgs),
    /// Master playlist operations
    #[command(subcommand)]
    Manifest(ManifestCommands),
    /// Registry track operations
    #[command(subcommand)]
    Track(TrackCommands),
    /// Registered assets
    #[command(subcommand)]
    Asset(AssetCommands),
    /// Checks configuration, registry and tooling
    Health,
}

#[derive(Args, Debug)]
pub struct DubArgs {
    /// External key of the section, e.g. its curriculum id
    #[arg(long)]
    pub section: String,
    /// Source video URL or path; required the first time a section is seen
    #[arg(long)]
    pub source: Option<String>,
    /// Target language codes
    #[arg(long = "lang", required = true, num_args = 1..)]
    pub languages: Vec<String>,
    /// Uploads to an in-memory store instead of the bucket
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum ManifestCommands {
    /// Rebuilds and republishes the master playlist from the registry
    Refresh(AssetArgs),
    /// Prints the published master playlist
    Show(AssetArgs),
    /// Adds an audio line to a local master playlist if it is missing
    Patch(ManifestPatchArgs),
}

#[derive(Args, Debug)]
pub struct AssetArgs {
    /// Asset id or external key
    #[arg(long)]
    pub asset: String,
}

#[derive(Args, Debug)]
pub struct ManifestPatchArgs {
    /// Local master.m3u8 to patch in place
    pub file: PathBuf,
    #[arg(long)]
    pub lang: String,
    /// Audio group id; defaults to playlist.group_id
    #[arg(long)]
    pub group: Option<String>,
    /// Prints the result instead of writing it
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum TrackCommands {
    /// Lists every track of an asset
    List(AssetArgs),
    /// Moves a failed track back to pending
    Retry(TrackArgs),
    /// Shows the status transitions of an asset's tracks
    History(TrackHistoryArgs),
    /// Publishes a local audio file as a language track
    Ingest(TrackIngestArgs),
}

#[derive(Args, Debug)]
pub struct TrackArgs {
    #[arg(long)]
    pub asset: String,
    #[arg(long)]
    pub lang: String,
}

#[derive(Args, Debug)]
pub struct TrackHistoryArgs {
    #[arg(long)]
    pub asset: String,
    /// Restricts the history to one language
    #[arg(long)]
    pub lang: Option<String>,
}

#[derive(Args, Debug)]
pub struct TrackIngestArgs {
    #[arg(long)]
    pub asset: String,
    #[arg(long)]
    pub lang: String,
    #[arg(long)]
    pub file: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum AssetCommands {
    /// Lists recently updated assets
    List(AssetListArgs),
}

#[derive(Args, Debug)]
pub struct AssetListArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

pub async fn run(cli: Cli) -> Result<()> {
    enforce_token(&cli)?;
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Dub(args) => {
            let orchestrator = context.orchestrator(args.dry_run).await?;
            let request = DubRequest {
                external_key: Some(args.section.clone()),
                source: args.source.clone(),
                languages: args.languages.clone(),
            };
            let outcome = orchestrator.dub(&request).await?;
            render(&outcome, cli.format)?;
            ensure_success(&outcome)?;
        }
        Commands::Manifest(ManifestCommands::Refresh(args)) => {
            let orchestrator = context.orchestrator(false).await?;
            let outcome = orchestrator.refresh_manifest(&args.asset).await?;
            render(&outcome, cli.format)?;
            ensure_success(&outcome)?;
        }
        Commands::Manifest(ManifestCommands::Show(args)) => {
            let view = context.manifest_show(args).await?;
            render(&view, cli.format)?;
        }
        Commands::Manifest(ManifestCommands::Patch(args)) => {
            let result = context.manifest_patch(args)?;
            render(&result, cli.format)?;
        }
        Commands::Track(TrackCommands::List(args)) => {
            let list = context.track_list(args)?;
            render(&list, cli.format)?;
        }
        Commands::Track(TrackCommands::Retry(args)) => {
            let track = context.track_retry(args)?;
            render(&TrackList { asset_id: track.asset_id.clone(), rows: vec![track] }, cli.format)?;
        }
        Commands::Track(TrackCommands::History(args)) => {
            let history = context.track_history(args)?;
            render(&history, cli.format)?;
        }
        Commands::Track(TrackCommands::Ingest(args)) => {
            let orchestrator = context.orchestrator(false).await?;
            let outcome = orchestrator
                .ingest_audio(&args.asset, &args.lang, &args.file)
                .await?;
            render(&outcome, cli.format)?;
            ensure_success(&outcome)?;
        }
        Commands::Asset(AssetCommands::List(args)) => {
            let assets = context.asset_list(args)?;
            render(&assets, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::Unsuccessful(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn enforce_token(cli: &Cli) -> Result<()> {
    if let Ok(expected) = std::env::var("DUBCASTCTL_TOKEN") {
        match &cli.token {
            Some(provided) if provided == &expected => Ok(()),
            _ => Err(AppError::Authentication),
        }
    } else {
        Ok(())
    }
}

fn ensure_success(outcome: &DubOutcome) -> Result<()> {
    if outcome.success {
        Ok(())
    } else {
        Err(AppError::Unsuccessful(format!(
            "asset {} finished with status {:?}",
            outcome.asset_id, outcome.status
        )))
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: DubcastConfig,
    config_path: PathBuf,
    registry_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let mut config = load_dubcast_config(&config_path)?;
        if let Some(data_dir) = &cli.data_dir {
            config.paths.data_dir = data_dir.to_string_lossy().to_string();
        }
        let registry_path = cli
            .registry_db
            .clone()
            .unwrap_or_else(|| config.registry_path());

        Ok(Self {
            config,
            config_path,
            registry_path,
        })
    }

    fn registry(&self) -> Result<SqliteTrackRegistry> {
        if let Some(parent) = self.registry_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let registry = SqliteTrackRegistry::builder()
            .path(&self.registry_path)
            .build()?;
        registry.initialize()?;
        Ok(registry)
    }

    /// Inspection commands never create a database.
    fn existing_registry(&self) -> Result<SqliteTrackRegistry> {
        if !self.registry_path.exists() {
            return Err(AppError::InvalidArgument(format!(
                "registry {} does not exist",
                self.registry_path.display()
            )));
        }
        Ok(SqliteTrackRegistry::builder()
            .path(&self.registry_path)
            .create_if_missing(false)
            .build()?)
    }

    /// Wires every collaborator once; a dry run swaps the bucket and CDN for
    /// in-memory stand-ins.
    async fn orchestrator(&self, dry_run: bool) -> Result<Orchestrator> {
        let client = reqwest::Client::new();
        let (store, cdn): (Arc<dyn ObjectStore>, Arc<dyn CdnInvalidator>) = if dry_run {
            tracing::info!(bucket = %self.config.storage.bucket, "dry run; uploads stay in memory");
            (
                Arc::new(MemoryObjectStore::new()),
                Arc::new(RecordingInvalidator::default()),
            )
        } else {
            let store = S3ObjectStore::from_config(&self.config.storage).await?;
            let cdn: Arc<dyn CdnInvalidator> =
                match HttpCdnPurger::from_config(client.clone(), &self.config.cdn) {
                    Some(purger) => Arc::new(purger),
                    None => Arc::new(NoopInvalidator),
                };
            (Arc::new(store), cdn)
        };
        let remote = RemoteReconciler::new(
            store,
            cdn,
            CachePolicy::from_config(&self.config.storage),
            self.config.storage.public_base_url.clone(),
        );
        let provider = ElevenLabsProvider::from_config(client, &self.config.provider)?;
        let pipeline = ArtifactPipeline::new(
            &self.config.transcoder.ffmpeg_path,
            TranscodeProfile::from_config(&self.config.transcoder),
        );
        let work_dir = self.config.resolve_path(&self.config.paths.work_dir);
        fs::create_dir_all(&work_dir)?;

        Ok(Orchestrator::new(
            self.registry()?,
            remote,
            Arc::new(provider),
            pipeline,
            OrchestratorSettings::from_config(&self.config),
        ))
    }

    async fn manifest_show(&self, args: &AssetArgs) -> Result<ManifestView> {
        let asset = self.existing_registry()?.lookup_asset(&args.asset)?;
        let store = S3ObjectStore::from_config(&self.config.storage).await?;
        let body = store_manifest(&store, &asset.manifest_key).await?;
        let codec = ManifestCodec::new(self.config.playlist.version);
        let (languages, parse_error) = match body.as_deref().map(|text| codec.parse(text)) {
            Some(Ok(parsed)) => (
                parsed.audios.iter().map(|a| a.language.clone()).collect(),
                None,
            ),
            Some(Err(err)) => (Vec::new(), Some(err.to_string())),
            None => (Vec::new(), None),
        };
        Ok(ManifestView {
            asset_id: asset.asset_id,
            manifest_key: asset.manifest_key,
            languages,
            parse_error,
            body,
        })
    }

    fn manifest_patch(&self, args: &ManifestPatchArgs) -> Result<PatchResult> {
        let language = parse_language(&args.lang)?;
        let group = args
            .group
            .clone()
            .unwrap_or_else(|| self.config.playlist.group_id.clone());
        let existing = fs::read_to_string(&args.file)?;
        let codec = ManifestCodec::new(self.config.playlist.version);
        let patched = codec.append_audio_if_absent(&existing, &AudioEntry::for_language(&language, group))?;
        let changed = patched != existing;
        if changed && !args.dry_run {
            fs::write(&args.file, &patched)?;
        }
        Ok(PatchResult {
            file: args.file.clone(),
            language,
            changed,
            written: changed && !args.dry_run,
            body: args.dry_run.then_some(patched),
        })
    }

    fn track_list(&self, args: &AssetArgs) -> Result<TrackList> {
        let registry = self.existing_registry()?;
        let asset = registry.lookup_asset(&args.asset)?;
        let rows = registry.list_tracks(&asset.asset_id)?;
        Ok(TrackList {
            asset_id: asset.asset_id,
            rows,
        })
    }

    fn track_retry(&self, args: &TrackArgs) -> Result<DubTrack> {
        let registry = self.existing_registry()?;
        let asset = registry.lookup_asset(&args.asset)?;
        let language = parse_language(&args.lang)?;
        Ok(registry.retry(&asset.asset_id, &language)?)
    }

    fn track_history(&self, args: &TrackHistoryArgs) -> Result<TrackHistory> {
        let registry = self.existing_registry()?;
        let asset = registry.lookup_asset(&args.asset)?;
        let language = args.lang.as_deref().map(parse_language).transpose()?;
        let rows = registry.history(&asset.asset_id, language.as_ref())?;
        Ok(TrackHistory {
            asset_id: asset.asset_id,
            rows,
        })
    }

    fn asset_list(&self, args: &AssetListArgs) -> Result<AssetList> {
        let rows = self.existing_registry()?.list_assets(args.limit)?;
        Ok(AssetList { rows })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = vec![self.check_path("dubcast.toml", &self.config_path)];
        results.push(self.check_registry());
        let work_dir = self.config.resolve_path(&self.config.paths.work_dir);
        results.push(self.check_directory("work_dir", &work_dir));
        results.push(self.check_ffmpeg());
        results.push(self.check_provider_key());
        results.push(if self.config.cdn.enabled {
            match self.config.cdn.api_token_path.as_deref() {
                Some(path) => self.check_path("cdn token", Path::new(path)),
                None => HealthEntry::error("cdn token", "cdn.enabled without api_token_path"),
            }
        } else {
            HealthEntry::warn("cdn", "disabled; manifests rely on cache expiry")
        });
        results
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(
                name,
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(
                name,
                format!("{path} not found", path = path.display()),
            ),
        }
    }

    fn check_registry(&self) -> HealthEntry {
        let name = "registry";
        if !self.registry_path.exists() {
            return HealthEntry::warn(
                name,
                format!("{path} not found", path = self.registry_path.display()),
            );
        }
        match self.existing_registry() {
            Ok(registry) => match registry.integrity_check() {
                Ok(result) if result.eq_ignore_ascii_case("ok") => {
                    HealthEntry::ok(name, "integrity ok")
                }
                Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                Err(err) => HealthEntry::error(name, format!("failed to open: {err}")),
            },
            Err(err) => HealthEntry::error(name, format!("failed to open: {err}")),
        }
    }

    fn check_ffmpeg(&self) -> HealthEntry {
        let ffmpeg = &self.config.transcoder.ffmpeg_path;
        let status = Command::new(ffmpeg)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => HealthEntry::ok("ffmpeg", ffmpeg.clone()),
            Ok(status) => HealthEntry::error("ffmpeg", format!("{ffmpeg} exited with {status}")),
            Err(err) => HealthEntry::error("ffmpeg", format!("{ffmpeg} not runnable: {err}")),
        }
    }

    fn check_provider_key(&self) -> HealthEntry {
        let name = "provider key";
        if std::env::var(API_KEY_ENV).is_ok_and(|key| !key.trim().is_empty()) {
            return HealthEntry::ok(name, format!("from {API_KEY_ENV}"));
        }
        match self.config.provider.api_key_path.as_deref() {
            Some(path) => self.check_path(name, Path::new(path)),
            None => HealthEntry::error(name, format!("set {API_KEY_ENV} or provider.api_key_path")),
        }
    }
}

async fn store_manifest(store: &dyn ObjectStore, key: &str) -> Result<Option<String>> {
    let body = store.get(key).await?;
    Ok(body.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
}

fn parse_language(code: &str) -> Result<Language> {
    code.parse()
        .map_err(|err: dubcast_core::UnsupportedLanguage| AppError::InvalidArgument(err.to_string()))
}

impl DisplayFallback for DubOutcome {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "asset {} | status={:?} | manifest={}",
            self.asset_id,
            self.status,
            self.manifest_url.as_deref().unwrap_or("-")
        )];
        for report in &self.languages {
            let detail = match &report.outcome {
                LanguageOutcome::Ready { url } => format!("ready {url}"),
                LanguageOutcome::AlreadyReady { url } => {
                    format!("already ready {}", url.as_deref().unwrap_or("-"))
                }
                LanguageOutcome::Failed { stage, reason } => format!("failed at {stage}: {reason}"),
                LanguageOutcome::Skipped { reason } => format!("skipped: {reason}"),
            };
            lines.push(format!("  {:<7} {detail}", report.language.as_str()));
        }
        if let Some(drift) = self.drift.as_ref().filter(|drift| !drift.is_empty()) {
            lines.push(format!(
                "  drift: added={:?} removed={:?}",
                drift.added, drift.removed
            ));
        }
        if self.manifest_recovered {
            lines.push("  replaced a corrupt published manifest".to_string());
        }
        if let Some(error) = &self.upload_error {
            lines.push(format!("  upload failed: {error}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ManifestView {
    pub asset_id: String,
    pub manifest_key: String,
    pub languages: Vec<Language>,
    pub parse_error: Option<String>,
    pub body: Option<String>,
}

impl DisplayFallback for ManifestView {
    fn display(&self) -> String {
        match (&self.body, &self.parse_error) {
            (None, _) => format!("{} is not published", self.manifest_key),
            (Some(body), Some(err)) => format!("{body}\n# unparseable: {err}"),
            (Some(body), None) => body.trim_end().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PatchResult {
    pub file: PathBuf,
    pub language: Language,
    pub changed: bool,
    pub written: bool,
    pub body: Option<String>,
}

impl DisplayFallback for PatchResult {
    fn display(&self) -> String {
        if let Some(body) = &self.body {
            return body.trim_end().to_string();
        }
        if self.written {
            format!("added {} to {}", self.language, self.file.display())
        } else {
            format!("{} already lists {}", self.file.display(), self.language)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TrackList {
    pub asset_id: String,
    pub rows: Vec<DubTrack>,
}

impl DisplayFallback for TrackList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return format!("no tracks for {}", self.asset_id);
        }
        self.rows
            .iter()
            .map(|track| {
                format!(
                    "{} | {} | attempts={} | {}",
                    track.language,
                    track.status,
                    track.attempts,
                    track
                        .url
                        .as_deref()
                        .or(track.failure_reason.as_deref())
                        .unwrap_or("-")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct TrackHistory {
    pub asset_id: String,
    pub rows: Vec<TrackEvent>,
}

impl DisplayFallback for TrackHistory {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return format!("no history for {}", self.asset_id);
        }
        self.rows
            .iter()
            .map(|event| {
                let at = event
                    .created_at
                    .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let from = event
                    .status_from
                    .map(|status| status.to_string())
                    .unwrap_or_else(|| "-".to_string());
                format!(
                    "{at} {} {from} -> {} {}",
                    event.language,
                    event.status_to,
                    event.note.as_deref().unwrap_or("")
                )
                .trim_end()
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct AssetList {
    pub rows: Vec<MediaAsset>,
}

impl DisplayFallback for AssetList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no assets registered".to_string();
        }
        self.rows
            .iter()
            .map(|asset| {
                format!(
                    "{} | key={} | {}",
                    asset.asset_id,
                    asset.external_key.as_deref().unwrap_or("-"),
                    asset.manifest_key
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name}: {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn prepare_test_context(command: Commands) -> Result<(TempDir, AppContext, Cli)> {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path().join("data");
        fs::create_dir_all(&data_dir).unwrap();
        let cli = Cli {
            config: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../configs/dubcast.toml"),
            data_dir: Some(data_dir),
            registry_db: None,
            token: None,
            format: OutputFormat::Json,
            command,
        };
        let context = AppContext::new(&cli)?;
        Ok((temp, context, cli))
    }

    fn seed(context: &AppContext) -> MediaAsset {
        let registry = context.registry().unwrap();
        let asset = registry
            .find_or_create_asset(&MediaAsset::new(
                "asset-1",
                Some("section-1".into()),
                "https://cdn.example.com/source.mp4",
                "assets/curriculumsection/section-1/master.m3u8",
            ))
            .unwrap();
        let ja: Language = "ja".parse().unwrap();
        registry.upsert_pending(&asset.asset_id, &ja).unwrap();
        registry.mark_processing(&asset.asset_id, &ja).unwrap();
        registry.mark_failed(&asset.asset_id, &ja, "timeout").unwrap();
        asset
    }

    #[test]
    fn data_dir_override_moves_the_registry() {
        let (temp, context, _cli) = prepare_test_context(Commands::Health).unwrap();
        assert!(context.registry_path.starts_with(temp.path()));
        assert!(context.registry_path.ends_with("registry.sqlite"));
    }

    #[test]
    fn inspection_requires_an_existing_registry() {
        let (_temp, context, _cli) = prepare_test_context(Commands::Health).unwrap();
        let err = context
            .track_list(&AssetArgs {
                asset: "section-1".into(),
            })
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[test]
    fn track_commands_read_and_retry() {
        let (_temp, context, _cli) = prepare_test_context(Commands::Health).unwrap();
        seed(&context);

        let list = context
            .track_list(&AssetArgs {
                asset: "section-1".into(),
            })
            .unwrap();
        assert_eq!(list.rows.len(), 1);
        assert_eq!(list.rows[0].failure_reason.as_deref(), Some("timeout"));

        let retried = context
            .track_retry(&TrackArgs {
                asset: "asset-1".into(),
                lang: "ja".into(),
            })
            .unwrap();
        assert_eq!(retried.status.as_str(), "pending");

        let history = context
            .track_history(&TrackHistoryArgs {
                asset: "section-1".into(),
                lang: Some("ja".into()),
            })
            .unwrap();
        assert_eq!(history.rows.len(), 4);
        assert!(history.display().contains("failed -> pending retry"));
    }

    #[test]
    fn asset_listing_returns_entries() {
        let (_temp, context, _cli) = prepare_test_context(Commands::Health).unwrap();
        seed(&context);
        let list = context.asset_list(&AssetListArgs { limit: 5 }).unwrap();
        assert_eq!(list.rows.len(), 1);
        assert_eq!(list.rows[0].external_key.as_deref(), Some("section-1"));
    }

    #[test]
    fn manifest_patch_adds_missing_language_once() {
        let (temp, context, _cli) = prepare_test_context(Commands::Health).unwrap();
        let file = temp.path().join("master.m3u8");
        fs::write(
            &file,
            "#EXTM3U\n#EXT-X-VERSION:6\n\n#EXT-X-STREAM-INF:BANDWIDTH=2500000\nvideo/video.m3u8\n",
        )
        .unwrap();
        let args = ManifestPatchArgs {
            file: file.clone(),
            lang: "ko".into(),
            group: None,
            dry_run: false,
        };

        let first = context.manifest_patch(&args).unwrap();
        assert!(first.written);
        let patched = fs::read_to_string(&file).unwrap();
        assert!(patched.contains("LANGUAGE=\"ko\""));
        assert!(patched.find("LANGUAGE=\"ko\"") < patched.find("#EXT-X-STREAM-INF"));

        let second = context.manifest_patch(&args).unwrap();
        assert!(!second.changed);
        assert_eq!(fs::read_to_string(&file).unwrap(), patched);
    }

    #[test]
    fn manifest_patch_refuses_corrupt_input() {
        let (temp, context, _cli) = prepare_test_context(Commands::Health).unwrap();
        let file = temp.path().join("master.m3u8");
        fs::write(&file, "not a playlist\n").unwrap();
        let err = context
            .manifest_patch(&ManifestPatchArgs {
                file: file.clone(),
                lang: "ko".into(),
                group: None,
                dry_run: false,
            })
            .unwrap_err();
        assert!(matches!(err, AppError::Playlist(_)));
        assert_eq!(fs::read_to_string(&file).unwrap(), "not a playlist\n");
    }

    #[test]
    fn cli_parses_repeated_languages() {
        let cli = Cli::parse_from([
            "dubcastctl",
            "dub",
            "--section",
            "section-1",
            "--source",
            "https://cdn.example.com/source.mp4",
            "--lang",
            "ja",
            "ko",
            "--dry-run",
        ]);
        match cli.command {
            Commands::Dub(args) => {
                assert_eq!(args.languages, vec!["ja", "ko"]);
                assert!(args.dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
