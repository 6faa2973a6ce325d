use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};

use crate::language::Language;
use crate::sqlite::configure_connection;

use super::models::{DubTrack, MediaAsset, TrackEvent, TrackStatus};
use super::{RegistryError, RegistryResult};

const REGISTRY_SCHEMA: &str = include_str!("../../../sql/registry.sql");

#[derive(Debug, Clone)]
pub struct SqliteTrackRegistryBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteTrackRegistryBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteTrackRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> RegistryResult<SqliteTrackRegistry> {
        let path = self.path.ok_or(RegistryError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteTrackRegistry { path, flags })
    }
}

/// Dub-track registry over SQLite. Every operation opens its own
/// connection, so a registry value can be cloned freely across tasks.
#[derive(Debug, Clone)]
pub struct SqliteTrackRegistry {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteTrackRegistry {
    pub fn builder() -> SqliteTrackRegistryBuilder {
        SqliteTrackRegistryBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> RegistryResult<Self> {
        SqliteTrackRegistryBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> RegistryResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            RegistryError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| RegistryError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> RegistryResult<()> {
        let conn = self.open()?;
        conn.execute_batch(REGISTRY_SCHEMA)?;
        Ok(())
    }

    /// Runs `PRAGMA integrity_check` and returns the first reported line.
    pub fn integrity_check(&self) -> RegistryResult<String> {
        let conn = self.open()?;
        let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(result)
    }

    // assets

    pub fn fetch_asset(&self, asset_id: &str) -> RegistryResult<Option<MediaAsset>> {
        let conn = self.open()?;
        let asset = conn
            .query_row(
                "SELECT * FROM media_assets WHERE asset_id = ?1",
                [asset_id],
                |row| MediaAsset::from_row(row),
            )
            .optional()?;
        Ok(asset)
    }

    pub fn find_asset_by_key(&self, external_key: &str) -> RegistryResult<Option<MediaAsset>> {
        let conn = self.open()?;
        let asset = conn
            .query_row(
                "SELECT * FROM media_assets WHERE external_key = ?1",
                [external_key],
                |row| MediaAsset::from_row(row),
            )
            .optional()?;
        Ok(asset)
    }

    /// Looks an asset up by id first, then by external key.
    pub fn lookup_asset(&self, reference: &str) -> RegistryResult<MediaAsset> {
        if let Some(asset) = self.fetch_asset(reference)? {
            return Ok(asset);
        }
        self.find_asset_by_key(reference)?
            .ok_or_else(|| RegistryError::AssetNotFound {
                reference: reference.to_string(),
            })
    }

    /// Inserts `asset` unless another asset already owns its external key,
    /// and returns the stored row either way.
    pub fn find_or_create_asset(&self, asset: &MediaAsset) -> RegistryResult<MediaAsset> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO media_assets (asset_id, external_key, source_url, manifest_key)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(external_key) DO NOTHING",
            params![
                &asset.asset_id,
                &asset.external_key,
                &asset.source_url,
                &asset.manifest_key,
            ],
        )?;
        drop(conn);

        let stored = match &asset.external_key {
            Some(key) => self.find_asset_by_key(key)?,
            None => self.fetch_asset(&asset.asset_id)?,
        };
        stored.ok_or_else(|| RegistryError::AssetNotFound {
            reference: asset.asset_id.clone(),
        })
    }

    /// Records a successful upload of a manifest built from `advertised`,
    /// the ready set read before the upload started.
    pub fn mark_published(&self, asset_id: &str, advertised: &[Language]) -> RegistryResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE media_assets
             SET published_at = CURRENT_TIMESTAMP, published_languages = ?2,
                 updated_at = CURRENT_TIMESTAMP
             WHERE asset_id = ?1",
            params![asset_id, language_list(advertised)],
        )?;
        if affected == 0 {
            return Err(RegistryError::AssetNotFound {
                reference: asset_id.to_string(),
            });
        }
        Ok(())
    }

    /// True when the ready set differs from what the last published manifest
    /// advertised, i.e. the remote manifest may be missing a track.
    pub fn publish_pending(&self, asset_id: &str) -> RegistryResult<bool> {
        let published: Option<String> = self
            .open()?
            .query_row(
                "SELECT published_languages FROM media_assets WHERE asset_id = ?1",
                [asset_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let ready: Vec<Language> = self
            .list_ready(asset_id)?
            .into_iter()
            .map(|track| track.language)
            .collect();
        Ok(published.unwrap_or_default() != language_list(&ready))
    }

    pub fn list_assets(&self, limit: usize) -> RegistryResult<Vec<MediaAsset>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM media_assets
             ORDER BY updated_at DESC, created_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| MediaAsset::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // tracks

    pub fn fetch_track(
        &self,
        asset_id: &str,
        language: &Language,
    ) -> RegistryResult<Option<DubTrack>> {
        let conn = self.open()?;
        Ok(fetch_track_with(&conn, asset_id, language)?)
    }

    pub fn list_tracks(&self, asset_id: &str) -> RegistryResult<Vec<DubTrack>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM dub_tracks WHERE asset_id = ?1 ORDER BY lang ASC")?;
        let rows = stmt
            .query_map([asset_id], |row| DubTrack::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Ready tracks of the asset, read fresh from the database.
    pub fn list_ready(&self, asset_id: &str) -> RegistryResult<Vec<DubTrack>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM dub_tracks
             WHERE asset_id = ?1 AND status = 'ready'
             ORDER BY lang ASC",
        )?;
        let rows = stmt
            .query_map([asset_id], |row| DubTrack::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Requested languages that are not ready yet, sorted and deduplicated.
    pub fn diff(&self, asset_id: &str, requested: &[Language]) -> RegistryResult<Vec<Language>> {
        let ready: BTreeSet<Language> = self
            .list_ready(asset_id)?
            .into_iter()
            .map(|track| track.language)
            .collect();
        let missing: BTreeSet<Language> = requested
            .iter()
            .filter(|language| !ready.contains(*language))
            .cloned()
            .collect();
        Ok(missing.into_iter().collect())
    }

    /// Creates a pending row if none exists. Existing rows are left untouched.
    pub fn upsert_pending(&self, asset_id: &str, language: &Language) -> RegistryResult<DubTrack> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT INTO dub_tracks (asset_id, lang, status) VALUES (?1, ?2, 'pending')
             ON CONFLICT(asset_id, lang) DO NOTHING",
            params![asset_id, language.as_str()],
        )?;
        if inserted == 1 {
            record_event(&tx, asset_id, language, None, TrackStatus::Pending, Some("requested"))?;
        }
        let track = fetch_track_with(&tx, asset_id, language)?;
        tx.commit()?;
        track.ok_or_else(|| RegistryError::TrackNotFound {
            asset_id: asset_id.to_string(),
            language: language.clone(),
        })
    }

    pub fn mark_processing(&self, asset_id: &str, language: &Language) -> RegistryResult<DubTrack> {
        self.transition(
            asset_id,
            language,
            &[TrackStatus::Pending],
            TrackStatus::Processing,
            None,
            |tx| {
                tx.execute(
                    "UPDATE dub_tracks
                     SET status = 'processing', attempts = attempts + 1,
                         failure_reason = NULL, updated_at = CURRENT_TIMESTAMP
                     WHERE asset_id = ?1 AND lang = ?2",
                    params![asset_id, language.as_str()],
                )
            },
        )
    }

    pub fn mark_ready(
        &self,
        asset_id: &str,
        language: &Language,
        url: &str,
    ) -> RegistryResult<DubTrack> {
        self.transition(
            asset_id,
            language,
            &[TrackStatus::Processing],
            TrackStatus::Ready,
            None,
            |tx| {
                tx.execute(
                    "UPDATE dub_tracks
                     SET status = 'ready', url = ?3, failure_reason = NULL,
                         updated_at = CURRENT_TIMESTAMP
                     WHERE asset_id = ?1 AND lang = ?2",
                    params![asset_id, language.as_str(), url],
                )
            },
        )
    }

    pub fn mark_failed(
        &self,
        asset_id: &str,
        language: &Language,
        reason: &str,
    ) -> RegistryResult<DubTrack> {
        self.transition(
            asset_id,
            language,
            &[TrackStatus::Processing],
            TrackStatus::Failed,
            Some(reason),
            |tx| {
                tx.execute(
                    "UPDATE dub_tracks
                     SET status = 'failed', url = NULL, failure_reason = ?3,
                         updated_at = CURRENT_TIMESTAMP
                     WHERE asset_id = ?1 AND lang = ?2",
                    params![asset_id, language.as_str(), reason],
                )
            },
        )
    }

    /// The only way out of `failed`.
    pub fn retry(&self, asset_id: &str, language: &Language) -> RegistryResult<DubTrack> {
        self.transition(
            asset_id,
            language,
            &[TrackStatus::Failed],
            TrackStatus::Pending,
            Some("retry"),
            |tx| {
                tx.execute(
                    "UPDATE dub_tracks
                     SET status = 'pending', failure_reason = NULL,
                         updated_at = CURRENT_TIMESTAMP
                     WHERE asset_id = ?1 AND lang = ?2",
                    params![asset_id, language.as_str()],
                )
            },
        )
    }

    /// Fails `processing` rows of the asset not updated since `cutoff`.
    pub fn fail_stale(
        &self,
        asset_id: &str,
        cutoff: DateTime<Utc>,
    ) -> RegistryResult<Vec<Language>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM dub_tracks
             WHERE asset_id = ?1 AND status = 'processing'
               AND datetime(updated_at) < datetime(?2)
             ORDER BY lang ASC",
        )?;
        let stale = stmt
            .query_map(
                params![asset_id, cutoff.format("%Y-%m-%d %H:%M:%S").to_string()],
                |row| DubTrack::from_row(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut failed = Vec::with_capacity(stale.len());
        for track in stale {
            match self.mark_failed(asset_id, &track.language, "stale") {
                Ok(_) => failed.push(track.language),
                // another writer settled the row first
                Err(RegistryError::InvalidTransition { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(failed)
    }

    pub fn history(
        &self,
        asset_id: &str,
        language: Option<&Language>,
    ) -> RegistryResult<Vec<TrackEvent>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM track_events
             WHERE asset_id = ?1 AND (?2 IS NULL OR lang = ?2)
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(
                params![asset_id, language.map(Language::as_str)],
                |row| TrackEvent::from_row(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn transition<F>(
        &self,
        asset_id: &str,
        language: &Language,
        allowed: &[TrackStatus],
        to: TrackStatus,
        note: Option<&str>,
        apply: F,
    ) -> RegistryResult<DubTrack>
    where
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<usize>,
    {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = fetch_track_with(&tx, asset_id, language)?.ok_or_else(|| {
            RegistryError::TrackNotFound {
                asset_id: asset_id.to_string(),
                language: language.clone(),
            }
        })?;
        if !allowed.contains(&current.status) {
            return Err(RegistryError::InvalidTransition {
                asset_id: asset_id.to_string(),
                language: language.clone(),
                from: current.status,
                to,
            });
        }
        apply(&tx)?;
        record_event(&tx, asset_id, language, Some(current.status), to, note)?;
        let updated = fetch_track_with(&tx, asset_id, language)?;
        tx.commit()?;
        updated.ok_or_else(|| RegistryError::TrackNotFound {
            asset_id: asset_id.to_string(),
            language: language.clone(),
        })
    }
}

fn fetch_track_with(
    conn: &Connection,
    asset_id: &str,
    language: &Language,
) -> rusqlite::Result<Option<DubTrack>> {
    conn.query_row(
        "SELECT * FROM dub_tracks WHERE asset_id = ?1 AND lang = ?2",
        params![asset_id, language.as_str()],
        |row| DubTrack::from_row(row),
    )
    .optional()
}

fn record_event(
    conn: &Connection,
    asset_id: &str,
    language: &Language,
    from: Option<TrackStatus>,
    to: TrackStatus,
    note: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO track_events (asset_id, lang, status_from, status_to, note)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            asset_id,
            language.as_str(),
            from.map(|status| status.as_str()),
            to.as_str(),
            note,
        ],
    )?;
    Ok(())
}

fn language_list(languages: &[Language]) -> String {
    languages
        .iter()
        .map(Language::as_str)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry() -> (tempfile::TempDir, SqliteTrackRegistry, MediaAsset) {
        let dir = tempdir().unwrap();
        let registry = SqliteTrackRegistry::builder()
            .path(dir.path().join("registry.sqlite"))
            .create_if_missing(true)
            .build()
            .unwrap();
        registry.initialize().unwrap();
        let asset = registry
            .find_or_create_asset(&MediaAsset::new(
                "asset-1",
                Some("section-1".into()),
                "https://cdn/source.mp4",
                "assets/curriculumsection/section-1/master.m3u8",
            ))
            .unwrap();
        (dir, registry, asset)
    }

    fn lang(code: &str) -> Language {
        code.parse().unwrap()
    }

    #[test]
    fn processing_cannot_be_skipped() {
        let (_dir, registry, asset) = registry();
        registry.upsert_pending(&asset.asset_id, &lang("ja")).unwrap();
        let err = registry
            .mark_ready(&asset.asset_id, &lang("ja"), "https://x")
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InvalidTransition {
                from: TrackStatus::Pending,
                to: TrackStatus::Ready,
                ..
            }
        ));
    }

    #[test]
    fn transitions_are_audited() {
        let (_dir, registry, asset) = registry();
        let id = asset.asset_id.as_str();
        registry.upsert_pending(id, &lang("ko")).unwrap();
        registry.mark_processing(id, &lang("ko")).unwrap();
        registry.mark_failed(id, &lang("ko"), "timeout").unwrap();
        registry.retry(id, &lang("ko")).unwrap();

        let events = registry.history(id, Some(&lang("ko"))).unwrap();
        let path: Vec<(Option<TrackStatus>, TrackStatus)> = events
            .iter()
            .map(|event| (event.status_from, event.status_to))
            .collect();
        assert_eq!(
            path,
            vec![
                (None, TrackStatus::Pending),
                (Some(TrackStatus::Pending), TrackStatus::Processing),
                (Some(TrackStatus::Processing), TrackStatus::Failed),
                (Some(TrackStatus::Failed), TrackStatus::Pending),
            ]
        );
        assert_eq!(events[2].note.as_deref(), Some("timeout"));
    }

    #[test]
    fn stale_processing_rows_fail() {
        let (_dir, registry, asset) = registry();
        let id = asset.asset_id.as_str();
        registry.upsert_pending(id, &lang("de")).unwrap();
        registry.mark_processing(id, &lang("de")).unwrap();
        registry.upsert_pending(id, &lang("fr")).unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(registry.fail_stale(id, past).unwrap().is_empty());

        let future = Utc::now() + chrono::Duration::minutes(1);
        assert_eq!(registry.fail_stale(id, future).unwrap(), vec![lang("de")]);
        let track = registry.fetch_track(id, &lang("de")).unwrap().unwrap();
        assert_eq!(track.status, TrackStatus::Failed);
        assert_eq!(track.failure_reason.as_deref(), Some("stale"));
        let untouched = registry.fetch_track(id, &lang("fr")).unwrap().unwrap();
        assert_eq!(untouched.status, TrackStatus::Pending);
    }

    #[test]
    fn publishing_clears_pending_manifest() {
        let (_dir, registry, asset) = registry();
        let id = asset.asset_id.as_str();
        assert!(!registry.publish_pending(id).unwrap());

        registry.upsert_pending(id, &lang("ja")).unwrap();
        registry.mark_processing(id, &lang("ja")).unwrap();
        registry.mark_ready(id, &lang("ja"), "https://cdn/ja").unwrap();
        assert!(registry.publish_pending(id).unwrap());

        registry.mark_published(id, &[lang("ja")]).unwrap();
        assert!(!registry.publish_pending(id).unwrap());
        assert!(registry.fetch_asset(id).unwrap().unwrap().published_at.is_some());
    }

    #[test]
    fn track_ready_during_upload_stays_pending() {
        let (_dir, registry, asset) = registry();
        let id = asset.asset_id.as_str();
        registry.upsert_pending(id, &lang("zh")).unwrap();
        let snapshot: Vec<Language> = registry
            .list_ready(id)
            .unwrap()
            .into_iter()
            .map(|track| track.language)
            .collect();
        assert!(snapshot.is_empty());

        registry.mark_processing(id, &lang("zh")).unwrap();
        registry.mark_ready(id, &lang("zh"), "https://cdn/zh").unwrap();
        registry.mark_published(id, &snapshot).unwrap();

        assert!(registry.publish_pending(id).unwrap());
        registry.mark_published(id, &[lang("zh")]).unwrap();
        assert!(!registry.publish_pending(id).unwrap());
    }

    #[test]
    fn lookup_accepts_id_or_external_key() {
        let (_dir, registry, asset) = registry();
        assert_eq!(registry.lookup_asset("asset-1").unwrap(), asset);
        assert_eq!(registry.lookup_asset("section-1").unwrap(), asset);
        assert!(matches!(
            registry.lookup_asset("nope"),
            Err(RegistryError::AssetNotFound { .. })
        ));
    }
}
