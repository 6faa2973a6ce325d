use dubcast_core::playlist::{
    project_audio_entries, AudioEntry, ManifestCodec, VideoEntry, VIDEO_PLAYLIST_PATH,
};
use dubcast_core::Language;

const POOL: &[&str] = &["origin", "en", "ja", "ko", "zh"];

fn video() -> VideoEntry {
    VideoEntry {
        bandwidth: 2_500_000,
        resolution: "1920x1080".into(),
        codecs: "avc1.4d401f,mp4a.40.2".into(),
        uri: VIDEO_PLAYLIST_PATH.into(),
        audio_group: "aud".into(),
    }
}

fn priority() -> Vec<Language> {
    vec!["ja".parse().unwrap(), "ko".parse().unwrap()]
}

/// Every subset of the pool, as parsed languages.
fn subsets() -> Vec<Vec<Language>> {
    (0..(1u32 << POOL.len()))
        .map(|mask| {
            POOL.iter()
                .enumerate()
                .filter(|(index, _)| mask & (1 << index) != 0)
                .map(|(_, code)| code.parse().unwrap())
                .collect()
        })
        .collect()
}

#[test]
fn at_most_one_default_for_every_ready_set() {
    let codec = ManifestCodec::default();
    for ready in subsets() {
        let entries = project_audio_entries(&ready, "aud", &priority());
        let parsed = codec.parse(&codec.build(Some(&video()), &entries)).unwrap();
        let defaults: Vec<&AudioEntry> = parsed.audios.iter().filter(|a| a.is_default).collect();

        let eligible = ready
            .iter()
            .any(|lang| lang.is_origin() || priority().contains(lang));
        assert_eq!(defaults.len(), usize::from(eligible), "ready set {ready:?}");
        if ready.iter().any(Language::is_origin) {
            assert!(defaults[0].language.is_origin());
        }
    }
}

#[test]
fn patching_agrees_with_rebuilding() {
    let codec = ManifestCodec::default();
    let extra: Language = "de".parse().unwrap();
    for ready in subsets() {
        let entries = project_audio_entries(&ready, "aud", &priority());
        let base = codec.build(Some(&video()), &entries);
        let patched = codec
            .append_audio_if_absent(&base, &AudioEntry::for_language(&extra, "aud"))
            .unwrap();

        let mut grown = ready.clone();
        grown.push(extra.clone());
        let rebuilt = codec.build(
            Some(&video()),
            &project_audio_entries(&grown, "aud", &priority()),
        );
        assert_eq!(
            codec.parse(&patched).unwrap().languages(),
            codec.parse(&rebuilt).unwrap().languages()
        );
        assert_eq!(
            codec.append_audio_if_absent(&patched, &AudioEntry::for_language(&extra, "aud")).unwrap(),
            patched
        );
    }
}
