use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag of the track carrying the source video's own audio.
pub const ORIGIN: &str = "origin";

/// Languages the dubbing provider accepts as targets.
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "ar", "bg", "cs", "da", "de", "el", "en", "es", "fi", "fr", "he", "hi", "hu", "id", "it", "ja",
    "ko", "ms", "nl", "no", "pl", "pt", "ro", "ru", "sk", "sv", "th", "tr", "uk", "vi", "zh", "fil",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported language code: {0}")]
pub struct UnsupportedLanguage(pub String);

/// A language tag from the closed set of supported codes, or the origin track.
///
/// Ordering is plain code order; playlist ordering (origin first) is applied
/// by the codec, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Language(String);

impl Language {
    pub fn origin() -> Self {
        Self(ORIGIN.to_string())
    }

    pub fn is_origin(&self) -> bool {
        self.0 == ORIGIN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name advertised in the playlist for this track.
    pub fn display_name(&self) -> String {
        if self.is_origin() {
            ORIGIN.to_uppercase()
        } else {
            self.0.clone()
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_lowercase();
        if code == ORIGIN || SUPPORTED_LANGUAGES.contains(&code.as_str()) {
            Ok(Self(code))
        } else {
            Err(UnsupportedLanguage(s.to_string()))
        }
    }
}

impl TryFrom<String> for Language {
    type Error = UnsupportedLanguage;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Language> for String {
    fn from(language: Language) -> Self {
        language.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_codes_case_insensitively() {
        let lang: Language = " JA ".parse().unwrap();
        assert_eq!(lang.as_str(), "ja");
        assert!(!lang.is_origin());
        assert_eq!(lang.display_name(), "ja");
    }

    #[test]
    fn origin_is_accepted_and_named() {
        let origin: Language = "origin".parse().unwrap();
        assert!(origin.is_origin());
        assert_eq!(origin.display_name(), "ORIGIN");
    }

    #[test]
    fn rejects_codes_outside_the_closed_set() {
        let err = "xx".parse::<Language>().unwrap_err();
        assert_eq!(err, UnsupportedLanguage("xx".into()));
    }

    #[test]
    fn serde_uses_the_plain_code() {
        let lang: Language = serde_json::from_str("\"zh\"").unwrap();
        assert_eq!(serde_json::to_string(&lang).unwrap(), "\"zh\"");
        assert!(serde_json::from_str::<Language>("\"klingon\"").is_err());
    }
}
