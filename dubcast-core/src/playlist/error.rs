use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PlaylistError {
    #[error("manifest missing #EXTM3U header")]
    MissingHeader,
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

impl PlaylistError {
    pub(crate) fn at(line: usize, reason: impl Into<String>) -> Self {
        PlaylistError::Parse {
            line,
            reason: reason.into(),
        }
    }
}

pub type PlaylistResult<T> = std::result::Result<T, PlaylistError>;
