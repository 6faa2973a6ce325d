use std::path::Path;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::TranscoderSection;

pub const INIT_SEGMENT_NAME: &str = "init.mp4";
pub const AUDIO_SEGMENT_PATTERN: &str = "a_%03d.m4s";
pub const VIDEO_SEGMENT_PATTERN: &str = "v_%03d.m4s";
pub const VIDEO_PLAYLIST_NAME: &str = "video.m3u8";

#[async_trait]
pub trait TranscodeExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemTranscodeExecutor;

#[async_trait]
impl TranscodeExecutor for SystemTranscodeExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        command.output().await
    }
}

/// Frozen ffmpeg argument contract, parameterised from `[transcoder]`.
#[derive(Debug, Clone)]
pub struct TranscodeProfile {
    pub segment_seconds: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub integrated: f64,
    pub lra: f64,
    pub true_peak: f64,
    pub video_codec: String,
    pub profile: String,
    pub level: String,
    pub preset: String,
    pub crf: u32,
    pub keyint: u32,
    pub min_keyint: u32,
    pub scenecut: u32,
}

impl Default for TranscodeProfile {
    fn default() -> Self {
        Self {
            segment_seconds: 4,
            audio_codec: "aac".into(),
            audio_bitrate: "128k".into(),
            sample_rate: 48_000,
            channels: 2,
            integrated: -16.0,
            lra: 11.0,
            true_peak: -1.5,
            video_codec: "libx264".into(),
            profile: "main".into(),
            level: "4.1".into(),
            preset: "veryfast".into(),
            crf: 23,
            keyint: 48,
            min_keyint: 48,
            scenecut: 0,
        }
    }
}

impl TranscodeProfile {
    pub fn from_config(section: &TranscoderSection) -> Self {
        Self {
            segment_seconds: section.segment_seconds,
            audio_codec: section.audio_codec.clone(),
            audio_bitrate: section.audio_bitrate.clone(),
            sample_rate: section.sample_rate,
            channels: section.channels,
            integrated: section.integrated,
            lra: section.lra,
            true_peak: section.true_peak,
            video_codec: section.codec.clone(),
            profile: section.profile.clone(),
            level: section.level.clone(),
            preset: section.preset.clone(),
            crf: section.crf,
            keyint: section.keyint,
            min_keyint: section.min_keyint,
            scenecut: section.scenecut,
        }
    }

    /// Stream copy of the source's audio track.
    pub fn extract_copy_args(&self, source: &str, output: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            source.into(),
            "-vn".into(),
            "-acodec".into(),
            "copy".into(),
            path_arg(output),
        ]
    }

    /// Re-encode fallback when the source codec cannot be copied.
    pub fn extract_encode_args(&self, source: &str, output: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            source.into(),
            "-vn".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "192k".into(),
            path_arg(output),
        ]
    }

    pub fn decode_args(&self, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            path_arg(input),
            "-vn".into(),
            "-acodec".into(),
            "pcm_s16le".into(),
            "-ar".into(),
            self.sample_rate.to_string(),
            "-ac".into(),
            self.channels.to_string(),
            path_arg(output),
        ]
    }

    pub fn loudnorm_filter(&self) -> String {
        format!(
            "loudnorm=I={}:LRA={}:TP={}",
            self.integrated, self.lra, self.true_peak
        )
    }

    pub fn normalize_args(&self, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            path_arg(input),
            "-af".into(),
            self.loudnorm_filter(),
            "-ar".into(),
            self.sample_rate.to_string(),
            "-ac".into(),
            self.channels.to_string(),
            path_arg(output),
        ]
    }

    /// Runs with the rendition directory as working directory; output names
    /// are relative.
    pub fn segment_audio_args(&self, input: &Path, playlist_name: &str) -> Vec<String> {
        let mut args = vec![
            "-y".into(),
            "-i".into(),
            path_arg(input),
            "-c:a".into(),
            self.audio_codec.clone(),
            "-b:a".into(),
            self.audio_bitrate.clone(),
            "-ar".into(),
            self.sample_rate.to_string(),
            "-ac".into(),
            self.channels.to_string(),
        ];
        args.extend(self.hls_args(AUDIO_SEGMENT_PATTERN, playlist_name));
        args
    }

    pub fn segment_video_args(&self, source: &str) -> Vec<String> {
        let mut args = vec![
            "-y".into(),
            "-i".into(),
            source.into(),
            "-map".into(),
            "0:v:0".into(),
            "-c:v".into(),
            self.video_codec.clone(),
            "-profile:v".into(),
            self.profile.clone(),
            "-level".into(),
            self.level.clone(),
            "-preset".into(),
            self.preset.clone(),
            "-crf".into(),
            self.crf.to_string(),
            "-x264-params".into(),
            format!(
                "keyint={}:min-keyint={}:scenecut={}",
                self.keyint, self.min_keyint, self.scenecut
            ),
        ];
        args.extend(self.hls_args(VIDEO_SEGMENT_PATTERN, VIDEO_PLAYLIST_NAME));
        args
    }

    fn hls_args(&self, segment_pattern: &str, playlist_name: &str) -> Vec<String> {
        vec![
            "-start_number".into(),
            "0".into(),
            "-hls_time".into(),
            self.segment_seconds.to_string(),
            "-hls_playlist_type".into(),
            "vod".into(),
            "-hls_segment_type".into(),
            "fmp4".into(),
            "-hls_fmp4_init_filename".into(),
            INIT_SEGMENT_NAME.into(),
            "-hls_flags".into(),
            "independent_segments".into(),
            "-hls_segment_filename".into(),
            segment_pattern.into(),
            playlist_name.into(),
        ]
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
