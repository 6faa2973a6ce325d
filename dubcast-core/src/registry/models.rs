use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::language::Language;
use crate::playlist::MASTER_PLAYLIST_NAME;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl TrackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackStatus::Pending => "pending",
            TrackStatus::Processing => "processing",
            TrackStatus::Ready => "ready",
            TrackStatus::Failed => "failed",
        }
    }

    /// Ready and failed rows only move again through an explicit retry.
    pub fn terminal(&self) -> bool {
        matches!(self, TrackStatus::Ready | TrackStatus::Failed)
    }
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TrackStatus::Pending),
            "processing" => Ok(TrackStatus::Processing),
            "ready" => Ok(TrackStatus::Ready),
            "failed" => Ok(TrackStatus::Failed),
            other => Err(format!("unknown track status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaAsset {
    pub asset_id: String,
    pub external_key: Option<String>,
    pub source_url: String,
    pub manifest_key: String,
    /// Last time a manifest built from the registry reached the store.
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MediaAsset {
    pub fn new(
        asset_id: impl Into<String>,
        external_key: Option<String>,
        source_url: impl Into<String>,
        manifest_key: impl Into<String>,
    ) -> Self {
        Self {
            asset_id: asset_id.into(),
            external_key,
            source_url: source_url.into(),
            manifest_key: manifest_key.into(),
            published_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Remote prefix under which every artifact of the asset lives,
    /// always ending in `/`.
    pub fn key_prefix(&self) -> String {
        let prefix = self
            .manifest_key
            .strip_suffix(MASTER_PLAYLIST_NAME)
            .unwrap_or(&self.manifest_key);
        if prefix.is_empty() || prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let published_at: Option<NaiveDateTime> = row.get("published_at")?;
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        let updated_at: Option<NaiveDateTime> = row.get("updated_at")?;
        Ok(Self {
            asset_id: row.get("asset_id")?,
            external_key: row.get("external_key")?,
            source_url: row.get("source_url")?,
            manifest_key: row.get("manifest_key")?,
            published_at: published_at.map(|dt| Utc.from_utc_datetime(&dt)),
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
            updated_at: updated_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DubTrack {
    pub asset_id: String,
    pub language: Language,
    pub status: TrackStatus,
    pub url: Option<String>,
    pub failure_reason: Option<String>,
    pub attempts: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DubTrack {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        let updated_at: Option<NaiveDateTime> = row.get("updated_at")?;
        Ok(Self {
            asset_id: row.get("asset_id")?,
            language: language_column(row, "lang")?,
            status: status_column(row, "status")?,
            url: row.get("url")?,
            failure_reason: row.get("failure_reason")?,
            attempts: row.get::<_, Option<i64>>("attempts")?.unwrap_or(0),
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
            updated_at: updated_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }
}

/// One row of the transition audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackEvent {
    pub asset_id: String,
    pub language: Language,
    pub status_from: Option<TrackStatus>,
    pub status_to: TrackStatus,
    pub note: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl TrackEvent {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        let status_from = match row.get::<_, Option<String>>("status_from")? {
            Some(_) => Some(status_column(row, "status_from")?),
            None => None,
        };
        Ok(Self {
            asset_id: row.get("asset_id")?,
            language: language_column(row, "lang")?,
            status_from,
            status_to: status_column(row, "status_to")?,
            note: row.get("note")?,
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }
}

fn language_column(row: &Row<'_>, column: &str) -> rusqlite::Result<Language> {
    let value: String = row.get(column)?;
    value.parse().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            row.as_ref().column_index(column).unwrap_or(0),
            Type::Text,
            Box::new(err),
        )
    })
}

fn status_column(row: &Row<'_>, column: &str) -> rusqlite::Result<TrackStatus> {
    let value: String = row.get(column)?;
    value.parse().map_err(|err: String| {
        rusqlite::Error::FromSqlConversionFailure(
            row.as_ref().column_index(column).unwrap_or(0),
            Type::Text,
            err.into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefix_strips_master_name() {
        let asset = MediaAsset::new(
            "a1",
            Some("42".into()),
            "https://cdn/source.mp4",
            "assets/curriculumsection/42/master.m3u8",
        );
        assert_eq!(asset.key_prefix(), "assets/curriculumsection/42/");
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            TrackStatus::Pending,
            TrackStatus::Processing,
            TrackStatus::Ready,
            TrackStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TrackStatus>().unwrap(), status);
        }
        assert!("done".parse::<TrackStatus>().is_err());
        assert!(TrackStatus::Failed.terminal());
        assert!(!TrackStatus::Processing.terminal());
    }
}
