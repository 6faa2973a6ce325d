pub mod cdn;
pub mod error;
pub mod memory;
pub mod s3;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::StorageSection;
use crate::playlist::MASTER_PLAYLIST_NAME;

pub use cdn::{HttpCdnPurger, NoopInvalidator};
pub use error::{RemoteError, RemoteResult};
pub use memory::{MemoryObjectStore, RecordingInvalidator};
pub use s3::S3ObjectStore;

pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const STAGING_SUFFIX: &str = ".staging";
const UPLOAD_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectMetadata {
    pub content_type: String,
    pub cache_control: String,
}

/// Key/value object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns `None` when the key does not exist.
    async fn get(&self, key: &str) -> RemoteResult<Option<Vec<u8>>>;
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        cache_control: &str,
    ) -> RemoteResult<()>;
    async fn exists(&self, key: &str) -> RemoteResult<bool>;
    /// Server-side copy. `metadata` replaces the source object's headers.
    async fn copy(
        &self,
        source_key: &str,
        dest_key: &str,
        metadata: Option<&ObjectMetadata>,
    ) -> RemoteResult<()>;
    async fn delete(&self, key: &str) -> RemoteResult<()>;
}

#[async_trait]
pub trait CdnInvalidator: Send + Sync {
    async fn invalidate(&self, urls: &[String]) -> RemoteResult<()>;
}

/// Cache headers per file category.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub manifest: String,
    pub segment: String,
}

impl CachePolicy {
    pub fn from_config(section: &StorageSection) -> Self {
        Self {
            manifest: section.manifest_cache_control.clone(),
            segment: section.segment_cache_control.clone(),
        }
    }

    pub fn metadata_for(&self, path: &Path) -> ObjectMetadata {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        let (content_type, cache_control) = match extension.as_str() {
            "m3u8" => (MANIFEST_CONTENT_TYPE, &self.manifest),
            "m4s" => ("video/iso.segment", &self.segment),
            "mp4" => ("video/mp4", &self.segment),
            "mp3" => ("audio/mpeg", &self.segment),
            "wav" => ("audio/wav", &self.segment),
            "aac" => ("audio/aac", &self.segment),
            _ => ("application/octet-stream", &self.segment),
        };
        ObjectMetadata {
            content_type: content_type.to_string(),
            cache_control: cache_control.clone(),
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            manifest: "public, max-age=60".to_string(),
            segment: "public, max-age=31536000, immutable".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
struct UploadItem {
    local: PathBuf,
    key: String,
    metadata: ObjectMetadata,
}

/// Mediates every interaction with the object store and the CDN.
#[derive(Clone)]
pub struct RemoteReconciler {
    store: Arc<dyn ObjectStore>,
    cdn: Arc<dyn CdnInvalidator>,
    policy: CachePolicy,
    public_base_url: String,
}

impl std::fmt::Debug for RemoteReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteReconciler")
            .field("store", &"<dyn ObjectStore>")
            .field("cdn", &"<dyn CdnInvalidator>")
            .field("policy", &self.policy)
            .field("public_base_url", &self.public_base_url)
            .finish()
    }
}

impl RemoteReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cdn: Arc<dyn CdnInvalidator>,
        policy: CachePolicy,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cdn,
            policy,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key.trim_start_matches('/'))
    }

    /// Work-skipping probe. Store errors count as "absent" so the caller
    /// regenerates instead of failing.
    pub async fn exists(&self, key: &str) -> bool {
        match self.store.exists(key).await {
            Ok(found) => found,
            Err(err) => {
                warn!(key, error = %err, "existence check failed; treating as absent");
                false
            }
        }
    }

    pub async fn fetch_manifest(&self, key: &str) -> RemoteResult<Option<String>> {
        let body = self.store.get(key).await?;
        Ok(body.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Uploads every file below `root` under `prefix`. Media goes first,
    /// then child playlists, and the root master playlist last so it never
    /// references a rendition that is not uploaded yet.
    pub async fn upload_tree(&self, root: &Path, prefix: &str) -> RemoteResult<UploadReport> {
        let mut media = Vec::new();
        let mut playlists = Vec::new();
        let mut master = None;

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| RemoteError::Config(format!("{} escapes upload root", entry.path().display())))?;
            let item = UploadItem {
                local: entry.path().to_path_buf(),
                key: join_key(prefix, relative),
                metadata: self.policy.metadata_for(entry.path()),
            };
            if relative == Path::new(MASTER_PLAYLIST_NAME) {
                master = Some(item);
            } else if item.metadata.content_type == MANIFEST_CONTENT_TYPE {
                playlists.push(item);
            } else {
                media.push(item);
            }
        }

        let mut report = UploadReport::default();
        for batch in [media, playlists] {
            let uploaded = self.upload_batch(batch).await?;
            report.files += uploaded.files;
            report.bytes += uploaded.bytes;
        }
        if let Some(master) = master {
            let bytes = self.publish_manifest(&master.local, &master.key).await?;
            report.files += 1;
            report.bytes += bytes;
        }
        info!(prefix, files = report.files, bytes = report.bytes, "upload complete");
        Ok(report)
    }

    /// Writes a manifest through a staging key and a server-side copy, so
    /// readers of `key` only ever see a complete object.
    pub async fn publish_manifest(&self, local: &Path, key: &str) -> RemoteResult<u64> {
        let body = read_file(local).await?;
        let bytes = body.len() as u64;
        let metadata = self.policy.metadata_for(local);
        let staging = format!("{key}{STAGING_SUFFIX}");
        self.store
            .put(&staging, body, &metadata.content_type, &metadata.cache_control)
            .await?;
        self.store.copy(&staging, key, Some(&metadata)).await?;
        if let Err(err) = self.store.delete(&staging).await {
            warn!(key = %staging, error = %err, "failed to remove staging manifest");
        }
        debug!(key, bytes, "manifest published");
        Ok(bytes)
    }

    /// Purges the public URL of exactly this manifest. Never fails the caller.
    pub async fn invalidate(&self, manifest_key: &str) -> bool {
        let url = self.public_url(manifest_key);
        match self.cdn.invalidate(std::slice::from_ref(&url)).await {
            Ok(()) => {
                info!(url = %url, "cdn invalidation requested");
                true
            }
            Err(err) => {
                warn!(url = %url, error = %err, "cdn invalidation failed");
                false
            }
        }
    }

    async fn upload_batch(&self, items: Vec<UploadItem>) -> RemoteResult<UploadReport> {
        let sizes: Vec<u64> = stream::iter(items)
            .map(|item| async move {
                let body = read_file(&item.local).await?;
                let bytes = body.len() as u64;
                self.store
                    .put(
                        &item.key,
                        body,
                        &item.metadata.content_type,
                        &item.metadata.cache_control,
                    )
                    .await?;
                debug!(key = %item.key, bytes, "uploaded");
                Ok::<_, RemoteError>(bytes)
            })
            .buffer_unordered(UPLOAD_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(UploadReport {
            files: sizes.len(),
            bytes: sizes.iter().sum(),
        })
    }
}

async fn read_file(path: &Path) -> RemoteResult<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|source| RemoteError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn join_key(prefix: &str, relative: &Path) -> String {
    let relative = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if prefix.is_empty() {
        relative
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn reconciler(store: Arc<MemoryObjectStore>, cdn: Arc<RecordingInvalidator>) -> RemoteReconciler {
        RemoteReconciler::new(store, cdn, CachePolicy::default(), "https://media.example.com/")
    }

    #[test]
    fn metadata_follows_extension() {
        let policy = CachePolicy::default();
        let manifest = policy.metadata_for(Path::new("audio/ja/audio.m3u8"));
        assert_eq!(manifest.content_type, MANIFEST_CONTENT_TYPE);
        assert_eq!(manifest.cache_control, "public, max-age=60");
        let segment = policy.metadata_for(Path::new("audio/ja/a_000.m4s"));
        assert_eq!(segment.content_type, "video/iso.segment");
        assert!(segment.cache_control.contains("immutable"));
        assert_eq!(policy.metadata_for(Path::new("init.mp4")).content_type, "video/mp4");
    }

    #[tokio::test]
    async fn upload_tree_tags_and_orders_objects() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("audio/ja")).unwrap();
        fs::write(root.join("audio/ja/init.mp4"), b"init").unwrap();
        fs::write(root.join("audio/ja/a_000.m4s"), b"seg0").unwrap();
        fs::write(root.join("audio/ja/audio.m3u8"), b"#EXTM3U\n").unwrap();
        fs::write(root.join("master.m3u8"), b"#EXTM3U\n#EXT-X-VERSION:6\n").unwrap();

        let store = Arc::new(MemoryObjectStore::new());
        let cdn = Arc::new(RecordingInvalidator::default());
        let remote = reconciler(store.clone(), cdn);
        let report = remote.upload_tree(root, "assets/s/7/").await.unwrap();
        assert_eq!(report.files, 4);

        let master = store.object("assets/s/7/master.m3u8").unwrap();
        assert_eq!(master.metadata.content_type, MANIFEST_CONTENT_TYPE);
        let segment = store.object("assets/s/7/audio/ja/a_000.m4s").unwrap();
        assert_eq!(segment.metadata.content_type, "video/iso.segment");
        assert!(store.object("assets/s/7/master.m3u8.staging").is_none());

        let puts = store.put_log();
        assert_eq!(puts.last().map(String::as_str), Some("assets/s/7/master.m3u8.staging"));
    }

    #[tokio::test]
    async fn invalidation_failure_is_not_fatal() {
        let store = Arc::new(MemoryObjectStore::new());
        let cdn = Arc::new(RecordingInvalidator::failing());
        let remote = reconciler(store, cdn.clone());
        assert!(!remote.invalidate("assets/s/7/master.m3u8").await);

        let ok = Arc::new(RecordingInvalidator::default());
        let remote = reconciler(Arc::new(MemoryObjectStore::new()), ok.clone());
        assert!(remote.invalidate("assets/s/7/master.m3u8").await);
        assert_eq!(ok.urls(), vec!["https://media.example.com/assets/s/7/master.m3u8"]);
    }
}
