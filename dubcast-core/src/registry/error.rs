use std::path::PathBuf;

use thiserror::Error;

use crate::language::Language;

use super::models::TrackStatus;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("registry path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("asset {reference} not found")]
    AssetNotFound { reference: String },
    #[error("track {language} of asset {asset_id} not found")]
    TrackNotFound { asset_id: String, language: Language },
    #[error("track {language} of asset {asset_id} cannot move from {from} to {to}")]
    InvalidTransition {
        asset_id: String,
        language: Language,
        from: TrackStatus,
        to: TrackStatus,
    },
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
