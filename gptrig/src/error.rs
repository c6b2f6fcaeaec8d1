//! Errors of a run: everything the core can fail with plus file and state
//! errors of the driver.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Core(#[from] gpcore::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decoding error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// Operation not allowed in the current run state
    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, RunError>;
