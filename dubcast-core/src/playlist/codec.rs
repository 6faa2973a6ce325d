use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;

use crate::language::Language;

use super::entries::{AudioEntry, VideoEntry};
use super::error::{PlaylistError, PlaylistResult};

const HEADER_TAG: &str = "#EXTM3U";
const VERSION_TAG: &str = "#EXT-X-VERSION:";
const MEDIA_TAG: &str = "#EXT-X-MEDIA:";
const STREAM_INF_TAG: &str = "#EXT-X-STREAM-INF:";

pub const DEFAULT_PLAYLIST_VERSION: u32 = 6;

/// Master playlist as read back from text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedManifest {
    pub version: Option<u32>,
    pub audios: Vec<AudioEntry>,
    pub video: Option<VideoEntry>,
}

impl ParsedManifest {
    pub fn languages(&self) -> BTreeSet<Language> {
        self.audios
            .iter()
            .map(|entry| entry.language.clone())
            .collect()
    }

    pub fn has_language(&self, language: &Language) -> bool {
        self.audios.iter().any(|entry| &entry.language == language)
    }
}

static ATTRIBUTE: OnceLock<Regex> = OnceLock::new();

fn attribute_pattern() -> &'static Regex {
    ATTRIBUTE.get_or_init(|| {
        Regex::new(r#"([A-Z0-9-]+)=("[^"]*"|[^,]*)"#).expect("valid attribute regex")
    })
}

/// Encoder and decoder for the HLS master playlist. Holds no I/O state.
#[derive(Debug, Clone)]
pub struct ManifestCodec {
    version: u32,
}

impl Default for ManifestCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PLAYLIST_VERSION)
    }
}

impl ManifestCodec {
    pub fn new(version: u32) -> Self {
        Self { version }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Renders the full master playlist.
    ///
    /// Audio entries are emitted origin first, then by language code. The
    /// caller is responsible for flagging at most one entry as default.
    pub fn build(&self, video: Option<&VideoEntry>, audios: &[AudioEntry]) -> String {
        let mut sorted: Vec<&AudioEntry> = audios.iter().collect();
        sorted.sort_by(|a, b| sort_key(&a.language).cmp(&sort_key(&b.language)));
        sorted.dedup_by(|a, b| a.language == b.language);
        debug_assert!(
            sorted.iter().filter(|entry| entry.is_default).count() <= 1,
            "more than one default audio entry"
        );

        let mut lines = vec![
            HEADER_TAG.to_string(),
            format!("{VERSION_TAG}{}", self.version),
            String::new(),
        ];
        for entry in &sorted {
            lines.push(render_audio(entry));
        }
        if !sorted.is_empty() {
            lines.push(String::new());
        }
        if let Some(video) = video {
            lines.push(render_stream_inf(video, !sorted.is_empty()));
            lines.push(video.uri.clone());
        }

        let mut text = lines.join("\n");
        text.push('\n');
        text
    }

    /// Inserts `entry` before the first `#EXT-X-STREAM-INF` line unless an
    /// audio line with the same LANGUAGE already exists. Other lines are kept
    /// verbatim. Malformed input is rejected rather than patched.
    pub fn append_audio_if_absent(
        &self,
        existing: &str,
        entry: &AudioEntry,
    ) -> PlaylistResult<String> {
        let parsed = self.parse(existing)?;
        if parsed.has_language(&entry.language) {
            return Ok(existing.to_string());
        }

        let rendered = render_audio(entry);
        let mut lines: Vec<&str> = existing.split('\n').collect();
        let stream_inf = lines
            .iter()
            .position(|line| line.trim_start().starts_with(STREAM_INF_TAG));

        let position = match stream_inf {
            Some(mut index) => {
                while index > 0 && lines[index - 1].trim().is_empty() {
                    index -= 1;
                }
                index
            }
            None if lines.last().is_some_and(|line| line.is_empty()) => lines.len() - 1,
            None => lines.len(),
        };
        lines.insert(position, &rendered);
        Ok(lines.join("\n"))
    }

    pub fn parse(&self, text: &str) -> PlaylistResult<ParsedManifest> {
        let lines: Vec<(usize, &str)> = text
            .lines()
            .enumerate()
            .map(|(index, line)| (index + 1, line.trim()))
            .collect();

        let mut iter = lines.iter().filter(|(_, line)| !line.is_empty()).peekable();
        match iter.next() {
            Some((_, line)) if *line == HEADER_TAG => {}
            _ => return Err(PlaylistError::MissingHeader),
        }

        let mut manifest = ParsedManifest::default();
        while let Some(&(number, line)) = iter.next() {
            if let Some(value) = line.strip_prefix(VERSION_TAG) {
                let version = value
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| PlaylistError::at(number, format!("invalid version {value:?}")))?;
                manifest.version = Some(version);
            } else if let Some(attrs) = line.strip_prefix(MEDIA_TAG) {
                let attrs = self.attributes(number, attrs)?;
                if attrs.get("TYPE").map(String::as_str) == Some("AUDIO") {
                    manifest.audios.push(audio_from_attributes(number, &attrs)?);
                }
            } else if let Some(attrs) = line.strip_prefix(STREAM_INF_TAG) {
                if manifest.video.is_some() {
                    return Err(PlaylistError::at(number, "more than one stream-inf line"));
                }
                let attrs = self.attributes(number, attrs)?;
                let uri = match iter.next_if(|(_, next)| !next.starts_with('#')) {
                    Some(&(_, uri)) => uri.to_string(),
                    None => return Err(PlaylistError::at(number, "stream-inf without uri")),
                };
                manifest.video = Some(video_from_attributes(number, &attrs, uri)?);
            } else if !line.starts_with('#') {
                return Err(PlaylistError::at(number, format!("unexpected uri {line:?}")));
            }
        }
        Ok(manifest)
    }

    fn attributes(&self, number: usize, raw: &str) -> PlaylistResult<HashMap<String, String>> {
        if raw.matches('"').count() % 2 != 0 {
            return Err(PlaylistError::at(number, "unterminated quoted attribute"));
        }
        let attrs = attribute_pattern()
            .captures_iter(raw)
            .map(|caps| {
                let value = caps[2].trim_matches('"').to_string();
                (caps[1].to_string(), value)
            })
            .collect::<HashMap<_, _>>();
        if attrs.is_empty() {
            return Err(PlaylistError::at(number, "tag without attributes"));
        }
        Ok(attrs)
    }
}

fn sort_key(language: &Language) -> (bool, &str) {
    (!language.is_origin(), language.as_str())
}

fn render_audio(entry: &AudioEntry) -> String {
    format!(
        "{MEDIA_TAG}TYPE=AUDIO,GROUP-ID=\"{}\",NAME=\"{}\",LANGUAGE=\"{}\",AUTOSELECT=YES,DEFAULT={},URI=\"{}\"",
        entry.group_id,
        entry.name,
        entry.language.as_str(),
        if entry.is_default { "YES" } else { "NO" },
        entry.uri,
    )
}

fn render_stream_inf(video: &VideoEntry, with_audio: bool) -> String {
    let mut line = format!(
        "{STREAM_INF_TAG}BANDWIDTH={},RESOLUTION={},CODECS=\"{}\"",
        video.bandwidth, video.resolution, video.codecs
    );
    if with_audio {
        line.push_str(&format!(",AUDIO=\"{}\"", video.audio_group));
    }
    line
}

fn required<'a>(
    number: usize,
    attrs: &'a HashMap<String, String>,
    key: &str,
) -> PlaylistResult<&'a String> {
    attrs
        .get(key)
        .ok_or_else(|| PlaylistError::at(number, format!("missing {key} attribute")))
}

fn audio_from_attributes(
    number: usize,
    attrs: &HashMap<String, String>,
) -> PlaylistResult<AudioEntry> {
    let language: Language = required(number, attrs, "LANGUAGE")?
        .parse()
        .map_err(|err| PlaylistError::at(number, format!("{err}")))?;
    Ok(AudioEntry {
        name: attrs
            .get("NAME")
            .cloned()
            .unwrap_or_else(|| language.display_name()),
        uri: required(number, attrs, "URI")?.clone(),
        group_id: required(number, attrs, "GROUP-ID")?.clone(),
        is_default: attrs.get("DEFAULT").map(String::as_str) == Some("YES"),
        language,
    })
}

fn video_from_attributes(
    number: usize,
    attrs: &HashMap<String, String>,
    uri: String,
) -> PlaylistResult<VideoEntry> {
    let bandwidth = required(number, attrs, "BANDWIDTH")?;
    let bandwidth = bandwidth
        .parse::<u64>()
        .map_err(|_| PlaylistError::at(number, format!("invalid bandwidth {bandwidth:?}")))?;
    Ok(VideoEntry {
        bandwidth,
        resolution: attrs.get("RESOLUTION").cloned().unwrap_or_default(),
        codecs: attrs.get("CODECS").cloned().unwrap_or_default(),
        audio_group: attrs.get("AUDIO").cloned().unwrap_or_default(),
        uri,
    })
}
