//! Scheduler data model and its persisted JSON shape.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The single "who may drive execution right now" fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLock {
    #[serde(rename = "conversationId")]
    pub holder_id: String,
    #[serde(rename = "agentPubkey")]
    pub requester_id: String,
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub acquired_at: DateTime<Utc>,
    /// Maximum holding time in milliseconds, when timeouts are enforced.
    #[serde(
        rename = "maxDuration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_duration_ms: Option<u64>,
}

impl ExecutionLock {
    pub fn new(holder_id: &str, requester_id: &str, max_duration: Option<Duration>) -> Self {
        Self {
            holder_id: holder_id.to_string(),
            requester_id: requester_id.to_string(),
            acquired_at: Utc::now(),
            max_duration_ms: max_duration.map(|d| d.as_millis() as u64),
        }
    }

    /// Time since the lock was granted (zero if the clock went backwards).
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or_default()
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }

    /// Whether the lock has outlived its configured maximum duration.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.max_duration()
            .map(|max| self.age(now) > max)
            .unwrap_or(false)
    }
}

/// A holder waiting for the execution lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(rename = "conversationId")]
    pub holder_id: String,
    #[serde(rename = "agentPubkey")]
    pub requester_id: String,
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,
    #[serde(rename = "retryCount", default)]
    pub retry_count: u32,
}

impl QueueEntry {
    pub fn new(holder_id: &str, requester_id: &str) -> Self {
        Self {
            holder_id: holder_id.to_string(),
            requester_id: requester_id.to_string(),
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }
}

/// Why an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Completed,
    Forced,
    Timeout,
    Error,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::Completed => "completed",
            EndReason::Forced => "forced",
            EndReason::Timeout => "timeout",
            EndReason::Error => "error",
        };
        f.write_str(s)
    }
}

/// One finished execution, kept for wait-time estimation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHistoryRecord {
    #[serde(rename = "conversationId")]
    pub holder_id: String,
    #[serde(rename = "agentPubkey")]
    pub requester_id: String,
    #[serde(rename = "startTime", with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "endTime", with = "chrono::serde::ts_milliseconds")]
    pub ended_at: DateTime<Utc>,
    #[serde(rename = "reason")]
    pub end_reason: EndReason,
}

impl ExecutionHistoryRecord {
    /// Close out a lock that is ending now.
    pub fn from_lock(lock: &ExecutionLock, end_reason: EndReason) -> Self {
        Self {
            holder_id: lock.holder_id.clone(),
            requester_id: lock.requester_id.clone(),
            started_at: lock.acquired_at,
            ended_at: Utc::now(),
            end_reason,
        }
    }

    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at).to_std().unwrap_or_default()
    }
}

/// Outcome of a request for execution rights. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPermission {
    pub granted: bool,
    pub wait_time: Option<Duration>,
    /// 1-based position in the wait queue when not granted.
    pub queue_position: Option<usize>,
    pub message: Option<String>,
}

impl ExecutionPermission {
    pub fn granted(message: impl Into<String>) -> Self {
        Self {
            granted: true,
            wait_time: Some(Duration::ZERO),
            queue_position: None,
            message: Some(message.into()),
        }
    }

    pub fn queued(position: usize, wait_time: Duration) -> Self {
        Self {
            granted: false,
            wait_time: Some(wait_time),
            queue_position: Some(position),
            message: Some(format!(
                "queued at position {position}, estimated wait {}s",
                wait_time.as_secs()
            )),
        }
    }
}

/// Read-only snapshot of the scheduler for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    pub active: Option<ExecutionLock>,
    pub queued: Vec<QueueEntry>,
    pub estimated_wait_secs: u64,
}

impl QueueState {
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queued.is_empty()
    }
}
