use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply { expected: &'static str, got: String },

    #[error("Job not found: {0}")]
    JobNotFound(u64),

    #[error("No queue server is configured")]
    NotConfigured,

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("No open queue connections")]
    NoConnections,
}

pub type Result<T> = std::result::Result<T, QueueError>;
