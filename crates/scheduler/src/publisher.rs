//! External status publishing.
//!
//! The scheduler hands state snapshots and forced-release notices to a
//! [`StatusPublisher`] through a [`PublisherWorker`]: a single background task
//! that delivers requests in submission order and logs failures. Scheduling
//! calls never wait on delivery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PublishError;
use crate::types::{ExecutionLock, QueueEntry};

/// Scheduler state as broadcast to external consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub active: Option<ExecutionLock>,
    pub queued: Vec<QueueEntry>,
    pub estimated_wait_secs: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Announcement that a holder lost the lock without releasing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForcedReleaseNotice {
    #[serde(rename = "conversationId")]
    pub holder_id: String,
    pub reason: String,
    #[serde(rename = "releasedBy")]
    pub released_by: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Sink for scheduler state transitions.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish_status(&self, snapshot: &StatusSnapshot) -> Result<(), PublishError>;

    async fn publish_forced_release(&self, notice: &ForcedReleaseNotice)
        -> Result<(), PublishError>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

// ── Log publisher ─────────────────────────────────────────────

/// Writes every publish request to the log.
#[derive(Debug, Default)]
pub struct LogStatusPublisher;

#[async_trait]
impl StatusPublisher for LogStatusPublisher {
    async fn publish_status(&self, snapshot: &StatusSnapshot) -> Result<(), PublishError> {
        info!(
            active = snapshot.active.as_ref().map(|l| l.holder_id.as_str()).unwrap_or("-"),
            queued = snapshot.queued.len(),
            estimated_wait_secs = snapshot.estimated_wait_secs,
            "execution queue status"
        );
        Ok(())
    }

    async fn publish_forced_release(
        &self,
        notice: &ForcedReleaseNotice,
    ) -> Result<(), PublishError> {
        warn!(
            holder = %notice.holder_id,
            reason = %notice.reason,
            released_by = %notice.released_by,
            "execution forcibly released"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

// ── Webhook publisher ─────────────────────────────────────────

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    event: &'a str,
    data: &'a T,
}

/// POSTs JSON envelopes (`{"event": ..., "data": ...}`) to a fixed URL.
#[derive(Debug)]
pub struct WebhookStatusPublisher {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl WebhookStatusPublisher {
    /// `${VAR_NAME}` references in `url` and header values are resolved
    /// from the environment here; a missing variable is a config error.
    pub fn new(url: &str, headers: &HashMap<String, String>) -> Result<Self, PublishError> {
        let url = resolve_env_vars(url)?;
        let headers = headers
            .iter()
            .map(|(k, v)| resolve_env_vars(v).map(|v| (k.clone(), v)))
            .collect::<Result<HashMap<_, _>, PublishError>>()?;
        Ok(Self {
            url,
            headers,
            client: reqwest::Client::new(),
        })
    }

    pub fn from_config(config: &baton_core::PublisherConfig) -> Result<Option<Self>, PublishError> {
        config
            .webhook_url
            .as_deref()
            .map(|url| Self::new(url, &config.headers))
            .transpose()
    }

    async fn post<T: Serialize>(&self, event: &str, data: &T) -> Result<(), PublishError> {
        let body = serde_json::to_vec(&Envelope { event, data })?;
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PublishError::Rejected {
                status: status.as_u16(),
            });
        }
        debug!(url = %self.url, event, %status, "status webhook delivered");
        Ok(())
    }
}

#[async_trait]
impl StatusPublisher for WebhookStatusPublisher {
    async fn publish_status(&self, snapshot: &StatusSnapshot) -> Result<(), PublishError> {
        self.post("execution-queue-status", snapshot).await
    }

    async fn publish_forced_release(
        &self,
        notice: &ForcedReleaseNotice,
    ) -> Result<(), PublishError> {
        self.post("execution-forced-release", notice).await
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Replace each `${NAME}` with the value of env var `NAME`.
fn resolve_env_vars(input: &str) -> Result<String, PublishError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            PublishError::Config(format!("unclosed env var reference in: {input}"))
        })?;
        let name = &after[..end];
        let value = std::env::var(name)
            .map_err(|_| PublishError::Config(format!("env var not found: {name}")))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

// ── Worker ────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum PublishRequest {
    Status(StatusSnapshot),
    ForcedRelease(ForcedReleaseNotice),
}

/// Background task draining publish requests into a [`StatusPublisher`].
pub(crate) struct PublisherWorker {
    tx: Option<mpsc::UnboundedSender<PublishRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl PublisherWorker {
    pub(crate) fn spawn(publisher: Arc<dyn StatusPublisher>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PublishRequest>();
        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let (kind, result) = match &request {
                    PublishRequest::Status(snapshot) => {
                        ("status", publisher.publish_status(snapshot).await)
                    }
                    PublishRequest::ForcedRelease(notice) => {
                        ("forced-release", publisher.publish_forced_release(notice).await)
                    }
                };
                if let Err(e) = result {
                    warn!(publisher = publisher.name(), kind, error = %e, "status publish failed");
                }
            }
            debug!(publisher = publisher.name(), "publisher worker stopped");
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Queue a request. Dropped silently once the worker is closed.
    pub(crate) fn submit(&self, request: PublishRequest) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(request);
        }
    }

    /// Stop accepting requests and wait for the backlog to drain.
    pub(crate) async fn close(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
