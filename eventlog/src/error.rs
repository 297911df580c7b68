//! Error types for the event log store.

use thiserror::Error;

/// Errors produced by event log operations.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed event body: {0}")]
    MalformedBody(String),

    #[error("unknown mailbox: {0}")]
    UnknownMailbox(String),
}

pub type Result<T> = std::result::Result<T, EventLogError>;
