//! Scheduler error types.

use thiserror::Error;

/// Errors surfaced to callers of the scheduling API.
///
/// Contention ("held by someone else", "nothing to release") is not an
/// error and is reported through `bool`/`Option` returns instead.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("execution queue is full (max {max_size} entries)")]
    QueueFull { max_size: usize },
}

/// Failures reading or writing the persisted state files.
///
/// Managers log and swallow these; in-memory state stays authoritative.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures delivering scheduler state to an external publisher.
///
/// Logged by the publisher worker; never returned from scheduling calls.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("publisher configuration error: {0}")]
    Config(String),

    #[error("publisher rejected payload with status {status}")]
    Rejected { status: u16 },
}
