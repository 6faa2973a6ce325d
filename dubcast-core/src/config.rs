use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::language::Language;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DubcastConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub registry: RegistrySection,
    pub storage: StorageSection,
    #[serde(default)]
    pub cdn: CdnSection,
    pub provider: ProviderSection,
    pub transcoder: TranscoderSection,
    pub playlist: PlaylistSection,
    pub limits: LimitsSection,
}

impl DubcastConfig {
    /// Resolves a relative path against `paths.data_dir`.
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.data_dir).join(path)
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.resolve_path(&self.registry.database)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub data_dir: String,
    pub work_dir: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    pub database: String,
    pub stale_processing_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub key_root: String,
    pub public_base_url: String,
    pub manifest_cache_control: String,
    pub segment_cache_control: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CdnSection {
    pub enabled: bool,
    pub api_base: Option<String>,
    pub zone_id: Option<String>,
    pub api_token_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSection {
    pub api_base: String,
    pub api_key_path: Option<String>,
    pub poll_attempts: u32,
    pub poll_interval_seconds: u64,
    #[serde(default)]
    pub prefer_muxed_video: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscoderSection {
    pub ffmpeg_path: String,
    pub segment_seconds: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub integrated: f64,
    pub lra: f64,
    pub true_peak: f64,
    pub codec: String,
    pub profile: String,
    pub level: String,
    pub preset: String,
    pub crf: u32,
    pub keyint: u32,
    pub min_keyint: u32,
    pub scenecut: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistSection {
    pub version: u32,
    pub group_id: String,
    pub include_origin: bool,
    pub default_priority: Vec<Language>,
    pub video_bandwidth: u64,
    pub video_resolution: String,
    pub video_codecs: String,
    #[serde(default)]
    pub force_regenerate_video: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub max_parallel_languages: usize,
}

pub fn load_dubcast_config<P: AsRef<Path>>(path: P) -> Result<DubcastConfig> {
    let path = path.as_ref();
    let config: DubcastConfig = load_toml(path)?;
    config.validate(path)?;
    Ok(config)
}

impl DubcastConfig {
    /// Rejects values that would only fail later, mid-pipeline.
    fn validate(&self, path: &Path) -> Result<()> {
        let checks: [(bool, &'static str, &'static str); 6] = [
            (self.limits.max_parallel_languages == 0, "limits.max_parallel_languages", "must be at least 1"),
            (self.provider.poll_attempts == 0, "provider.poll_attempts", "must be at least 1"),
            (self.transcoder.segment_seconds == 0, "transcoder.segment_seconds", "must be at least 1"),
            (self.playlist.group_id.trim().is_empty(), "playlist.group_id", "must not be empty"),
            (self.storage.key_root.trim_matches('/').is_empty(), "storage.key_root", "must not be empty"),
            (
                self.playlist.default_priority.iter().any(Language::is_origin),
                "playlist.default_priority",
                "must not list origin",
            ),
        ];
        match checks.into_iter().find(|(failed, _, _)| *failed) {
            Some((_, field, reason)) => Err(ConfigError::Invalid {
                path: path.to_path_buf(),
                field,
                reason,
            }),
            None => Ok(()),
        }
    }
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
