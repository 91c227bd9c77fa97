use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("pty error: {0}")]
    Pty(String),

    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process table unavailable: {0}")]
    ProcessTable(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
