use thiserror::Error;

#[derive(Error, Debug)]
pub enum TabulaError {
    #[error("session {session_id} belongs to a different owner")]
    OwnershipMismatch { session_id: String },

    #[error("session not found")]
    SessionNotFound,

    #[error("a previous message for session {session_id} is still being processed")]
    UpstreamBusy { session_id: String },

    #[error("automation engine error: status {status}: {detail}")]
    UpstreamFailure { status: u16, detail: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}
