use thiserror::Error;

/// Failure taxonomy for the sync engine.
///
/// `Network` and `UnreadableAttachment` are converted into outbox item state
/// at the queue boundary and never reach the caller. `Validation` is the only
/// variant an enqueue can surface. `Persistence` and `Serialization` are
/// best-effort telemetry: logged, never user-visible.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("attachment unreadable: {0}")]
    UnreadableAttachment(String),

    #[error("invalid message: {0}")]
    Validation(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
