use std::path::PathBuf;

/// Core error type for the bot.
///
/// Adapter crates map their specific errors into this type so the session and
/// dispatch layers can decide between degrading, retrying and tearing down.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("vault error: {0}")]
    Vault(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid backup reference: {0}")]
    InvalidReference(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("busy: {0}")]
    Busy(String),

    #[error("external error: {0}")]
    External(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::External(format!("http error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
