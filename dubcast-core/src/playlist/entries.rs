use serde::Serialize;

use crate::language::Language;

pub const MASTER_PLAYLIST_NAME: &str = "master.m3u8";
pub const AUDIO_PLAYLIST_NAME: &str = "audio.m3u8";
pub const VIDEO_PLAYLIST_PATH: &str = "video/video.m3u8";

/// Path of a language's audio sub-manifest, relative to the asset prefix.
pub fn audio_playlist_key(language: &Language) -> String {
    format!("audio/{}/{AUDIO_PLAYLIST_NAME}", language.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioEntry {
    pub language: Language,
    pub name: String,
    pub uri: String,
    pub group_id: String,
    pub is_default: bool,
}

impl AudioEntry {
    pub fn for_language(language: &Language, group_id: impl Into<String>) -> Self {
        Self {
            language: language.clone(),
            name: language.display_name(),
            uri: audio_playlist_key(language),
            group_id: group_id.into(),
            is_default: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoEntry {
    pub bandwidth: u64,
    pub resolution: String,
    pub codecs: String,
    pub uri: String,
    pub audio_group: String,
}

/// Sets the default flag on at most one entry: the origin track when
/// present, otherwise the first language of `priority` that is present.
pub fn assign_default(entries: &mut [AudioEntry], priority: &[Language]) {
    for entry in entries.iter_mut() {
        entry.is_default = false;
    }
    if let Some(origin) = entries.iter_mut().find(|e| e.language.is_origin()) {
        origin.is_default = true;
        return;
    }
    for candidate in priority {
        if let Some(entry) = entries.iter_mut().find(|e| &e.language == candidate) {
            entry.is_default = true;
            return;
        }
    }
}

/// Derives the audio entries for a set of ready languages.
pub fn project_audio_entries<'a, I>(
    languages: I,
    group_id: &str,
    priority: &[Language],
) -> Vec<AudioEntry>
where
    I: IntoIterator<Item = &'a Language>,
{
    let mut entries: Vec<AudioEntry> = languages
        .into_iter()
        .map(|language| AudioEntry::for_language(language, group_id))
        .collect();
    assign_default(&mut entries, priority);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn langs(codes: &[&str]) -> Vec<Language> {
        codes.iter().map(|c| c.parse().unwrap()).collect()
    }

    #[test]
    fn origin_wins_the_default() {
        let ready = langs(&["ja", "origin", "en"]);
        let entries = project_audio_entries(&ready, "aud", &langs(&["ja"]));
        let defaults: Vec<_> = entries.iter().filter(|e| e.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert!(defaults[0].language.is_origin());
        assert_eq!(defaults[0].name, "ORIGIN");
    }

    #[test]
    fn priority_list_is_consulted_in_order() {
        let ready = langs(&["ja", "ko", "zh"]);
        let entries = project_audio_entries(&ready, "aud", &langs(&["ko", "ja"]));
        let default = entries.iter().find(|e| e.is_default).unwrap();
        assert_eq!(default.language.as_str(), "ko");
    }

    #[test]
    fn no_default_without_origin_or_priority_match() {
        let ready = langs(&["en", "de"]);
        let entries = project_audio_entries(&ready, "aud", &langs(&["ja", "ko"]));
        assert!(entries.iter().all(|e| !e.is_default));
    }

    #[test]
    fn uri_points_at_language_directory() {
        let entry = AudioEntry::for_language(&"zh".parse().unwrap(), "aud");
        assert_eq!(entry.uri, "audio/zh/audio.m3u8");
    }
}
