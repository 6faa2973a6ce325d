use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::language::Language;
use crate::playlist::MASTER_PLAYLIST_NAME;

use super::error::{PipelineError, PipelineResult};

/// Files produced for one rendition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenditionArtifacts {
    pub dir: PathBuf,
    pub playlist: PathBuf,
    pub init_segment: PathBuf,
    pub segments: Vec<PathBuf>,
}

/// Per-run working tree.
///
/// `bundle/` mirrors the remote prefix and is uploaded as-is; `scratch/`
/// holds intermediates, one directory per language.
#[derive(Debug, Clone)]
pub struct WorkLayout {
    root: PathBuf,
}

impl WorkLayout {
    /// A fresh directory under `work_dir`, unique per run.
    pub fn for_run(work_dir: impl AsRef<Path>, asset_id: &str) -> Self {
        let run = format!("{asset_id}-{}", Uuid::new_v4().simple());
        Self {
            root: work_dir.as_ref().join(run),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bundle(&self) -> PathBuf {
        self.root.join("bundle")
    }

    pub fn master_path(&self) -> PathBuf {
        self.bundle().join(MASTER_PLAYLIST_NAME)
    }

    pub fn video_dir(&self) -> PathBuf {
        self.bundle().join("video")
    }

    pub fn audio_dir(&self, language: &Language) -> PathBuf {
        self.bundle().join("audio").join(language.as_str())
    }

    pub fn scratch(&self, language: &Language) -> PathBuf {
        self.root.join("scratch").join(language.as_str())
    }

    pub fn source_scratch(&self) -> PathBuf {
        self.root.join("scratch").join("_source")
    }

    pub async fn create(&self) -> PipelineResult<()> {
        let bundle = self.bundle();
        tokio::fs::create_dir_all(&bundle)
            .await
            .map_err(|source| PipelineError::Io {
                path: bundle,
                source,
            })
    }

    /// Removes one rendition directory so a failed language never uploads.
    pub async fn discard(&self, dir: &Path) {
        if let Err(err) = tokio::fs::remove_dir_all(dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dir.display(), error = %err, "failed to discard rendition directory");
            }
        }
    }

    pub async fn cleanup(&self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.root).await {
            warn!(path = %self.root.display(), error = %err, "failed to clean work directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_mirrors_remote_layout() {
        let layout = WorkLayout::for_run("/work", "asset-1");
        let ja: Language = "ja".parse().unwrap();
        let audio = layout.audio_dir(&ja);
        let relative = audio.strip_prefix(layout.bundle()).unwrap();
        assert_eq!(relative, Path::new("audio/ja"));
        assert!(!layout.scratch(&ja).starts_with(layout.bundle()));
        assert!(layout.root().starts_with("/work"));
    }

    #[test]
    fn runs_get_distinct_roots() {
        let first = WorkLayout::for_run("/work", "asset-1");
        let second = WorkLayout::for_run("/work", "asset-1");
        assert_ne!(first.root(), second.root());
    }
}
