pub mod command;
pub mod error;
pub mod types;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::events::{PipelineEvent, PipelineObserver, Stage};
use crate::language::Language;
use crate::playlist::AUDIO_PLAYLIST_NAME;

pub use command::{
    SystemTranscodeExecutor, TranscodeExecutor, TranscodeProfile, INIT_SEGMENT_NAME,
    VIDEO_PLAYLIST_NAME,
};
pub use error::{PipelineError, PipelineResult};
pub use types::{RenditionArtifacts, WorkLayout};

const STDERR_TAIL: usize = 2048;

/// Who a step runs for; used to address observer events.
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    pub asset_id: &'a str,
    pub language: Option<&'a Language>,
    pub observer: &'a dyn PipelineObserver,
}

impl<'a> StepContext<'a> {
    fn started(&self, stage: Stage) {
        self.observer
            .on_event(&PipelineEvent::stage(self.asset_id, self.language, stage));
    }
}

/// Turns source media into HLS renditions by driving ffmpeg.
#[derive(Clone)]
pub struct ArtifactPipeline {
    ffmpeg: PathBuf,
    profile: TranscodeProfile,
    executor: Arc<dyn TranscodeExecutor>,
}

impl ArtifactPipeline {
    pub fn new(ffmpeg: impl Into<PathBuf>, profile: TranscodeProfile) -> Self {
        Self::with_executor(ffmpeg, profile, Arc::new(SystemTranscodeExecutor))
    }

    pub fn with_executor(
        ffmpeg: impl Into<PathBuf>,
        profile: TranscodeProfile,
        executor: Arc<dyn TranscodeExecutor>,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            profile,
            executor,
        }
    }

    pub fn profile(&self) -> &TranscodeProfile {
        &self.profile
    }

    /// Extracts the source's own audio into `scratch/source.m4a`, copying
    /// the stream when possible and re-encoding otherwise.
    pub async fn extract_source_audio(
        &self,
        ctx: StepContext<'_>,
        source: &str,
        scratch: &Path,
    ) -> PipelineResult<PathBuf> {
        ensure_dir(scratch).await?;
        let output = scratch.join("source.m4a");
        ctx.started(Stage::ExtractSource);
        let copied = self
            .run_step(
                Stage::ExtractSource,
                self.profile.extract_copy_args(source, &output),
                None,
            )
            .await;
        if let Err(err) = copied {
            warn!(asset = ctx.asset_id, error = %err, "stream copy failed; re-encoding source audio");
            self.run_step(
                Stage::ExtractSource,
                self.profile.extract_encode_args(source, &output),
                None,
            )
            .await?;
        }
        require(Stage::ExtractSource, &output).await?;
        Ok(output)
    }

    /// Decode, loudness-normalise and segment one language's audio.
    /// Intermediates stay in `scratch`; only `out` receives publishable files.
    pub async fn package_audio(
        &self,
        ctx: StepContext<'_>,
        input: &Path,
        scratch: &Path,
        out: &Path,
    ) -> PipelineResult<RenditionArtifacts> {
        ensure_dir(scratch).await?;
        ensure_dir(out).await?;
        let scratch = absolute(scratch).await?;

        let decoded = scratch.join("source.wav");
        ctx.started(Stage::DecodeAudio);
        self.run_step(
            Stage::DecodeAudio,
            self.profile.decode_args(input, &decoded),
            None,
        )
        .await?;
        require(Stage::DecodeAudio, &decoded).await?;

        let aligned = scratch.join("aligned.wav");
        ctx.started(Stage::Normalize);
        self.run_step(
            Stage::Normalize,
            self.profile.normalize_args(&decoded, &aligned),
            None,
        )
        .await?;
        require(Stage::Normalize, &aligned).await?;

        ctx.started(Stage::SegmentAudio);
        self.run_step(
            Stage::SegmentAudio,
            self.profile.segment_audio_args(&aligned, AUDIO_PLAYLIST_NAME),
            Some(out),
        )
        .await?;
        collect_rendition(Stage::SegmentAudio, out, AUDIO_PLAYLIST_NAME).await
    }

    pub async fn package_video(
        &self,
        ctx: StepContext<'_>,
        source: &str,
        out: &Path,
    ) -> PipelineResult<RenditionArtifacts> {
        ensure_dir(out).await?;
        let source = anchored_input(source).await?;
        ctx.started(Stage::SegmentVideo);
        self.run_step(
            Stage::SegmentVideo,
            self.profile.segment_video_args(&source),
            Some(out),
        )
        .await?;
        collect_rendition(Stage::SegmentVideo, out, VIDEO_PLAYLIST_NAME).await
    }

    async fn run_step(
        &self,
        stage: Stage,
        args: Vec<String>,
        cwd: Option<&Path>,
    ) -> PipelineResult<()> {
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        debug!(stage = %stage, args = ?args, "running transcoder");
        let output = self
            .executor
            .run(&mut command)
            .await
            .map_err(|source| PipelineError::Spawn { stage, source })?;
        if !output.status.success() {
            return Err(PipelineError::Process {
                stage,
                status: output.status.code(),
                stderr: stderr_tail(&output.stderr),
            });
        }
        Ok(())
    }
}

async fn ensure_dir(dir: &Path) -> PipelineResult<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| PipelineError::Io {
            path: dir.to_path_buf(),
            source,
        })
}

async fn absolute(dir: &Path) -> PipelineResult<PathBuf> {
    tokio::fs::canonicalize(dir)
        .await
        .map_err(|source| PipelineError::Io {
            path: dir.to_path_buf(),
            source,
        })
}

/// The segmenting step runs inside the rendition directory, so a relative
/// local input is resolved against the process directory beforehand.
async fn anchored_input(source: &str) -> PipelineResult<String> {
    let path = Path::new(source);
    if source.contains("://") || path.is_absolute() {
        return Ok(source.to_string());
    }
    let resolved = tokio::fs::canonicalize(path)
        .await
        .map_err(|err| PipelineError::Io {
            path: path.to_path_buf(),
            source: err,
        })?;
    Ok(resolved.to_string_lossy().into_owned())
}

async fn require(stage: Stage, path: &Path) -> PipelineResult<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(PipelineError::MissingOutput {
            stage,
            path: path.to_path_buf(),
        }),
    }
}

/// Verifies playlist, init segment and at least one media segment exist.
async fn collect_rendition(
    stage: Stage,
    dir: &Path,
    playlist_name: &str,
) -> PipelineResult<RenditionArtifacts> {
    let playlist = dir.join(playlist_name);
    let init_segment = dir.join(INIT_SEGMENT_NAME);
    require(stage, &init_segment).await?;
    require(stage, &playlist).await?;

    let mut segments = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|source| PipelineError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|source| PipelineError::Io {
            path: dir.to_path_buf(),
            source,
        })?
    {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("m4s") {
            segments.push(path);
        }
    }
    if segments.is_empty() {
        return Err(PipelineError::MissingOutput {
            stage,
            path: dir.join("*.m4s"),
        });
    }
    segments.sort();
    Ok(RenditionArtifacts {
        dir: dir.to_path_buf(),
        playlist,
        init_segment,
        segments,
    })
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map(|(index, _)| index)
        .unwrap_or(0);
    trimmed[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Output;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::events::RecordingObserver;

    #[cfg(unix)]
    use std::os::unix::process::ExitStatusExt;
    #[cfg(windows)]
    use std::os::windows::process::ExitStatusExt;

    /// Materialises outputs named on the command line instead of running ffmpeg.
    struct MockExecutor {
        skip_init: bool,
        fail_first: Mutex<bool>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl MockExecutor {
        fn new() -> Self {
            Self {
                skip_init: false,
                fail_first: Mutex::new(false),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    fn status(code: u32) -> std::process::ExitStatus {
        std::process::ExitStatus::from_raw(code as _)
    }

    #[async_trait]
    impl TranscodeExecutor for MockExecutor {
        async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
            let inner = command.as_std();
            let args: Vec<String> = inner
                .get_args()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            self.calls.lock().unwrap().push(args.clone());
            {
                let mut fail = self.fail_first.lock().unwrap();
                if *fail {
                    *fail = false;
                    return Ok(Output {
                        status: status(256),
                        stdout: Vec::new(),
                        stderr: b"codec not supported".to_vec(),
                    });
                }
            }
            let cwd = inner.get_current_dir().map(Path::to_path_buf);
            let last = PathBuf::from(args.last().unwrap());
            let target = match &cwd {
                Some(dir) => dir.join(&last),
                None => last,
            };
            std::fs::write(&target, b"out")?;
            if let Some(dir) = cwd {
                if !self.skip_init {
                    std::fs::write(dir.join(INIT_SEGMENT_NAME), b"init")?;
                }
                std::fs::write(dir.join("a_000.m4s"), b"seg")?;
            }
            Ok(Output {
                status: status(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    fn pipeline(executor: Arc<MockExecutor>) -> ArtifactPipeline {
        ArtifactPipeline::with_executor("ffmpeg", TranscodeProfile::default(), executor)
    }

    #[tokio::test]
    async fn package_audio_runs_three_steps_in_isolated_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let executor = Arc::new(MockExecutor::new());
        let observer = RecordingObserver::default();
        let ja: Language = "ja".parse().unwrap();
        let ctx = StepContext {
            asset_id: "a1",
            language: Some(&ja),
            observer: &observer,
        };
        let input = temp.path().join("dubbed.mp3");
        std::fs::write(&input, b"mp3").unwrap();
        let scratch = temp.path().join("scratch/ja");
        let out = temp.path().join("bundle/audio/ja");

        let artifacts = pipeline(executor.clone())
            .package_audio(ctx, &input, &scratch, &out)
            .await
            .unwrap();
        assert_eq!(artifacts.init_segment, out.join("init.mp4"));
        assert_eq!(artifacts.segments, vec![out.join("a_000.m4s")]);
        assert!(!out.join("aligned.wav").exists());
        assert_eq!(
            observer.stages(),
            vec![Stage::DecodeAudio, Stage::Normalize, Stage::SegmentAudio]
        );
        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].contains(&"loudnorm=I=-16:LRA=11:TP=-1.5".to_string()));
    }

    #[tokio::test]
    async fn missing_init_segment_fails_despite_zero_exit() {
        let temp = tempfile::tempdir().unwrap();
        let executor = Arc::new(MockExecutor {
            skip_init: true,
            ..MockExecutor::new()
        });
        let observer = RecordingObserver::default();
        let ctx = StepContext {
            asset_id: "a1",
            language: None,
            observer: &observer,
        };
        let input = temp.path().join("in.mp3");
        std::fs::write(&input, b"mp3").unwrap();
        let err = pipeline(executor)
            .package_audio(ctx, &input, &temp.path().join("s"), &temp.path().join("o"))
            .await
            .unwrap_err();
        match err {
            PipelineError::MissingOutput { stage, path } => {
                assert_eq!(stage, Stage::SegmentAudio);
                assert!(path.ends_with("init.mp4"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn extraction_falls_back_to_reencode() {
        let temp = tempfile::tempdir().unwrap();
        let executor = Arc::new(MockExecutor::new());
        *executor.fail_first.lock().unwrap() = true;
        let observer = RecordingObserver::default();
        let ctx = StepContext {
            asset_id: "a1",
            language: None,
            observer: &observer,
        };
        let output = pipeline(executor.clone())
            .extract_source_audio(ctx, "https://cdn/source.mp4", temp.path())
            .await
            .unwrap();
        assert!(output.ends_with("source.m4a"));
        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains(&"copy".to_string()));
        assert!(calls[1].contains(&"192k".to_string()));
    }

    #[tokio::test]
    async fn relative_video_source_resolves_from_the_rendition_dir() {
        let temp = tempfile::tempdir().unwrap();
        let name = format!("relative-source-{}.mp4", std::process::id());
        std::fs::write(&name, b"mp4").unwrap();
        let executor = Arc::new(MockExecutor::new());
        let observer = RecordingObserver::default();
        let ctx = StepContext {
            asset_id: "a1",
            language: None,
            observer: &observer,
        };
        let out = temp.path().join("bundle/video");

        let result = pipeline(executor.clone())
            .package_video(ctx, &name, &out)
            .await;
        std::fs::remove_file(&name).unwrap();
        result.unwrap();

        let calls = executor.calls.lock().unwrap();
        let input = calls[0]
            .iter()
            .skip_while(|arg| arg.as_str() != "-i")
            .nth(1)
            .unwrap();
        assert!(Path::new(input).is_absolute());
        assert!(input.ends_with(&name));
    }

    #[tokio::test]
    async fn remote_video_source_is_passed_through() {
        assert_eq!(
            anchored_input("https://cdn/source.mp4").await.unwrap(),
            "https://cdn/source.mp4"
        );
        assert!(anchored_input("missing-relative-source.mp4").await.is_err());
    }

    #[test]
    fn stderr_is_truncated_from_the_front() {
        let long = "x".repeat(5000) + "tail";
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.ends_with("tail"));
        assert!(tail.len() <= STDERR_TAIL + 1);
    }
}
