use std::sync::Arc;
use std::thread;

use tempfile::TempDir;

use dubcast_core::registry::{MediaAsset, RegistryError, SqliteTrackRegistry, TrackStatus};
use dubcast_core::Language;

fn setup() -> (TempDir, SqliteTrackRegistry, MediaAsset) {
    let dir = tempfile::tempdir().unwrap();
    let registry = SqliteTrackRegistry::builder()
        .path(dir.path().join("registry.sqlite"))
        .build()
        .unwrap();
    registry.initialize().unwrap();
    let asset = registry
        .find_or_create_asset(&MediaAsset::new(
            "asset-1",
            Some("section-1".into()),
            "https://cdn.example.com/source.mp4",
            "assets/curriculumsection/section-1/master.m3u8",
        ))
        .unwrap();
    (dir, registry, asset)
}

fn lang(code: &str) -> Language {
    code.parse().unwrap()
}

#[test]
fn initialize_is_idempotent() {
    let (_dir, registry, _asset) = setup();
    registry.initialize().unwrap();
    assert_eq!(registry.integrity_check().unwrap(), "ok");
}

#[test]
fn duplicate_asset_keys_resolve_to_the_first_row() {
    let (_dir, registry, asset) = setup();
    let again = registry
        .find_or_create_asset(&MediaAsset::new(
            "asset-2",
            Some("section-1".into()),
            "https://cdn.example.com/other.mp4",
            "assets/curriculumsection/section-1/master.m3u8",
        ))
        .unwrap();
    assert_eq!(again.asset_id, asset.asset_id);
    assert_eq!(registry.list_assets(10).unwrap().len(), 1);
}

#[test]
fn concurrent_upserts_create_one_row() {
    let (_dir, registry, asset) = setup();
    let registry = Arc::new(registry);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let asset_id = asset.asset_id.clone();
            thread::spawn(move || registry.upsert_pending(&asset_id, &lang("ja")).unwrap())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().status, TrackStatus::Pending);
    }
    assert_eq!(registry.list_tracks(&asset.asset_id).unwrap().len(), 1);
    assert_eq!(registry.history(&asset.asset_id, None).unwrap().len(), 1);
}

#[test]
fn only_one_worker_claims_a_track() {
    let (_dir, registry, asset) = setup();
    registry.upsert_pending(&asset.asset_id, &lang("ko")).unwrap();
    let registry = Arc::new(registry);
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let asset_id = asset.asset_id.clone();
            thread::spawn(move || registry.mark_processing(&asset_id, &lang("ko")).is_ok())
        })
        .collect();
    let claimed = handles
        .into_iter()
        .filter_map(|handle| handle.join().ok())
        .filter(|claimed| *claimed)
        .count();
    assert_eq!(claimed, 1);
    let track = registry
        .fetch_track(&asset.asset_id, &lang("ko"))
        .unwrap()
        .unwrap();
    assert_eq!(track.attempts, 1);
}

#[test]
fn ready_tracks_stay_ready() {
    let (_dir, registry, asset) = setup();
    let id = asset.asset_id.as_str();
    registry.upsert_pending(id, &lang("en")).unwrap();
    registry.mark_processing(id, &lang("en")).unwrap();
    registry
        .mark_ready(id, &lang("en"), "https://media.example.com/audio/en/audio.m3u8")
        .unwrap();

    let again = registry.upsert_pending(id, &lang("en")).unwrap();
    assert_eq!(again.status, TrackStatus::Ready);
    for err in [
        registry.mark_processing(id, &lang("en")).unwrap_err(),
        registry.mark_failed(id, &lang("en"), "late").unwrap_err(),
        registry.retry(id, &lang("en")).unwrap_err(),
    ] {
        assert!(matches!(
            err,
            RegistryError::InvalidTransition {
                from: TrackStatus::Ready,
                ..
            }
        ));
    }
}

#[test]
fn diff_returns_sorted_missing_languages() {
    let (_dir, registry, asset) = setup();
    let id = asset.asset_id.as_str();
    registry.upsert_pending(id, &lang("ja")).unwrap();
    registry.mark_processing(id, &lang("ja")).unwrap();
    registry.mark_ready(id, &lang("ja"), "https://x/ja").unwrap();

    let missing = registry
        .diff(id, &[lang("zh"), lang("ja"), lang("de"), lang("zh")])
        .unwrap();
    assert_eq!(missing, vec![lang("de"), lang("zh")]);
}

#[test]
fn unknown_tracks_are_reported() {
    let (_dir, registry, asset) = setup();
    let err = registry
        .mark_processing(&asset.asset_id, &lang("fr"))
        .unwrap_err();
    assert!(matches!(err, RegistryError::TrackNotFound { .. }));
}
