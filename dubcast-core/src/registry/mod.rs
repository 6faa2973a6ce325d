pub mod error;
pub mod models;
pub mod store;

pub use error::{RegistryError, RegistryResult};
pub use models::{DubTrack, MediaAsset, TrackEvent, TrackStatus};
pub use store::{SqliteTrackRegistry, SqliteTrackRegistryBuilder};
