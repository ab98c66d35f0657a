// Taskwing Core error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskwingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Agent runtime not found: {0}")]
    RuntimeNotFound(String),

    #[error("Agent server already running or starting")]
    AlreadyRunning,

    #[error("Agent server startup failed: {0}")]
    Startup(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Stream buffer overflow: discarded {dropped} bytes of unparseable data")]
    ParserOverflow { dropped: usize },

    #[error("Adapter has been disposed")]
    Disposed,

    #[error("No active session")]
    NoActiveSession,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, TaskwingError>;
