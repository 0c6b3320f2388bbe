//! Error taxonomy shared across every boundary call.
//!
//! Each layer returns one of these tagged variants instead of raising; only
//! the scheduler and coordinator convert them into policy actions (retry,
//! disable, mode-switch). Never carries credential material.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CwError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("security blocked: {0}")]
    SecurityBlocked(String),

    #[error("connect error: {0}")]
    Connect(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CwError {
    /// Short machine-readable kind, surfaced on REST/WebSocket error frames
    /// alongside a human reason — never a stack trace, never credentials.
    pub fn kind(&self) -> &'static str {
        match self {
            CwError::Validation(_) => "validation_error",
            CwError::SecurityBlocked(_) => "security_blocked",
            CwError::Connect(_) => "connect_error",
            CwError::Timeout(_) => "timeout",
            CwError::Session(_) => "session_error",
            CwError::Parse(_) => "parse_error",
            CwError::Storage(_) => "storage_error",
        }
    }
}

pub type CwResult<T> = Result<T, CwError>;
