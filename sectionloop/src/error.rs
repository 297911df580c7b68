//! Typed errors at the module seams callers need to match on. Everything
//! else propagates as `eyre::Result` with `.context(...)`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal file {0} is not valid JSON: {1}")]
    Malformed(String, serde_json::Error),

    #[error("signal file {0} has unrecognized state {1:?}")]
    UnknownState(String, String),
}

#[derive(Debug, Error)]
pub enum PathSafetyError {
    #[error("path {path} escapes declared root {root}")]
    Escapes { path: String, root: String },

    #[error("path {0} does not exist")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("agent process failed to start: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("agent dispatch timed out after {0}s")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("coordination plan indices do not partition [0, {0})")]
    InvalidPartition(usize),

    #[error("coordinator round budget exhausted without alignment")]
    RoundsExhausted,
}
