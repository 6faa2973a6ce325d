pub mod codec;
pub mod entries;
pub mod error;

pub use codec::{ManifestCodec, ParsedManifest};
pub use entries::{
    assign_default, audio_playlist_key, project_audio_entries, AudioEntry, VideoEntry,
    AUDIO_PLAYLIST_NAME, MASTER_PLAYLIST_NAME, VIDEO_PLAYLIST_PATH,
};
pub use error::{PlaylistError, PlaylistResult};
