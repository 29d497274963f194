//! Public scheduling API.
//!
//! [`ExecutionScheduler`] composes the lock, the wait queue and the timeout
//! manager behind one async mutex, so every state transition runs start to
//! finish without another scheduler call interleaving. It is the only place
//! that touches both the lock and the queue.
//!
//! Per-holder lifecycle:
//!
//! ```text
//! unrequested ──► granted ─────────────────────► released
//!      │             ▲                  (completed/forced/timeout/error)
//!      └──► queued ──┘ (promotion)
//!             └──► removed (withdrawn before being granted)
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use baton_core::SchedulerConfig;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::events::{EventBus, SchedulerEvent};
use crate::lock::LockManager;
use crate::publisher::{
    ForcedReleaseNotice, PublishRequest, PublisherWorker, StatusPublisher, StatusSnapshot,
};
use crate::queue::QueueManager;
use crate::store::StateStore;
use crate::timeout::{TimeoutManager, TimeoutSignal};
use crate::types::{
    EndReason, ExecutionHistoryRecord, ExecutionLock, ExecutionPermission, QueueState,
};

const DEFAULT_OPERATOR: &str = "baton-scheduler";

struct State {
    locks: LockManager,
    queue: QueueManager,
    timeouts: TimeoutManager,
    publisher: Option<PublisherWorker>,
}

struct Inner {
    state: Mutex<State>,
    events: EventBus,
    config: SchedulerConfig,
    /// Identity reported as `releasedBy` on forced releases.
    operator: String,
}

/// Builder for [`ExecutionScheduler`].
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    project_path: Option<PathBuf>,
    publisher: Option<Arc<dyn StatusPublisher>>,
    operator: String,
}

impl SchedulerBuilder {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            project_path: None,
            publisher: None,
            operator: DEFAULT_OPERATOR.to_string(),
        }
    }

    /// Project the state is scoped to (default: current directory).
    pub fn project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    /// Broadcast state transitions to an external publisher.
    pub fn publisher(mut self, publisher: Arc<dyn StatusPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Name recorded as the releaser of forced releases.
    pub fn operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = operator.into();
        self
    }

    /// Open persisted state, recover from any previous run and start the
    /// background tasks. Must be called within a Tokio runtime.
    pub async fn build(self) -> ExecutionScheduler {
        let project = self
            .project_path
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        // The lock scope is compared as a string, so spell the path one way.
        let project = std::fs::canonicalize(&project).unwrap_or(project);
        let config = self.config;

        let store = if config.enable_persistence {
            let dir = config.state_dir(&project);
            StateStore::open(&dir).unwrap_or_else(|e| {
                warn!(path = %dir.display(), error = %e, "cannot open state dir, running without persistence");
                StateStore::disabled()
            })
        } else {
            StateStore::disabled()
        };

        let locks = LockManager::new(
            store.clone(),
            project.display().to_string(),
            config.max_execution_duration(),
        );
        info!(
            project = %project.display(),
            persistence = store.is_enabled(),
            state_dir = ?store.dir(),
            "opening execution scheduler"
        );
        let queue = QueueManager::new(store, config.max_queue_size, config.max_history_size);
        let (timeouts, signals) = TimeoutManager::new(config.timeout_warning());
        let publisher = self.publisher.map(PublisherWorker::spawn);

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                locks,
                queue,
                timeouts,
                publisher,
            }),
            events: EventBus::new(),
            config,
            operator: self.operator,
        });
        spawn_timeout_reactor(Arc::downgrade(&inner), signals);

        let scheduler = ExecutionScheduler { inner };
        scheduler.recover().await;
        scheduler
    }
}

/// Grants exclusive execution rights per project, FIFO among waiters.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ExecutionScheduler {
    inner: Arc<Inner>,
}

impl ExecutionScheduler {
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Ask for execution rights on behalf of `requester_id`.
    ///
    /// Grants immediately when the lock is free or already held by
    /// `holder_id`; otherwise queues the holder. Fails only when the queue
    /// is full.
    pub async fn request_execution(
        &self,
        holder_id: &str,
        requester_id: &str,
    ) -> Result<ExecutionPermission, SchedulerError> {
        let mut state = self.inner.state.lock().await;

        if state.locks.current_lock().is_none() && !state.queue.is_empty() {
            self.promote(&mut state);
        }

        match state.locks.current_lock() {
            Some(lock) if lock.holder_id == holder_id => {
                debug!(holder = %holder_id, "execution already granted");
                Ok(ExecutionPermission::granted("already holding execution lock"))
            }
            Some(_) => {
                let already_queued = state.queue.position(holder_id) > 0;
                let position = state.queue.enqueue(holder_id, requester_id)?;
                if !already_queued {
                    self.inner.events.emit(SchedulerEvent::QueueJoined {
                        holder_id: holder_id.to_string(),
                        position,
                    });
                    self.publish_status(&mut state);
                }
                let wait = state.queue.estimated_wait();
                Ok(ExecutionPermission::queued(position, wait))
            }
            None => {
                let granted = self.grant(&mut state, holder_id, requester_id);
                debug_assert!(granted, "free lock must be grantable");
                self.publish_status(&mut state);
                Ok(ExecutionPermission::granted("execution granted"))
            }
        }
    }

    /// Release execution rights held by `holder_id` and promote the next
    /// waiter. Returns `false` (and does nothing) if `holder_id` is not the
    /// holder.
    pub async fn release_execution(&self, holder_id: &str, reason: EndReason) -> bool {
        let mut state = self.inner.state.lock().await;
        self.finish(&mut state, holder_id, reason, None)
    }

    /// Administrative release of `holder_id`, recorded as `forced`.
    pub async fn force_release(&self, holder_id: &str, reason: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        self.finish(&mut state, holder_id, EndReason::Forced, Some(reason))
    }

    /// Force-release whoever holds the lock. Returns the evicted holder.
    pub async fn force_release_any(&self, reason: &str) -> Option<String> {
        let mut state = self.inner.state.lock().await;
        let holder = state.locks.current_lock()?.holder_id;
        self.finish(&mut state, &holder, EndReason::Forced, Some(reason))
            .then_some(holder)
    }

    /// Withdraw a waiting holder without ever granting it.
    pub async fn remove_from_queue(&self, holder_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        if !state.queue.remove(holder_id) {
            return false;
        }
        self.inner.events.emit(SchedulerEvent::QueueLeft {
            holder_id: holder_id.to_string(),
        });
        self.publish_status(&mut state);
        true
    }

    /// Drop every waiting holder. Returns how many were removed.
    pub async fn clear_queue(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let drained = state.queue.clear();
        for entry in &drained {
            self.inner.events.emit(SchedulerEvent::QueueLeft {
                holder_id: entry.holder_id.clone(),
            });
        }
        if !drained.is_empty() {
            self.publish_status(&mut state);
        }
        drained.len()
    }

    /// Snapshot of the active holder and the waiters, for status reporting.
    pub async fn get_execution_queue_state(&self) -> QueueState {
        let mut state = self.inner.state.lock().await;
        QueueState {
            active: state.locks.current_lock(),
            queued: state.queue.entries(),
            estimated_wait_secs: state.queue.estimated_wait().as_secs(),
        }
    }

    pub async fn current_holder(&self) -> Option<ExecutionLock> {
        self.inner.state.lock().await.locks.current_lock()
    }

    pub async fn is_holding(&self, holder_id: &str) -> bool {
        self.inner.state.lock().await.locks.is_held_by(holder_id)
    }

    /// 1-based queue position, 0 when not queued.
    pub async fn queue_position(&self, holder_id: &str) -> usize {
        self.inner.state.lock().await.queue.position(holder_id)
    }

    pub async fn history(&self) -> Vec<ExecutionHistoryRecord> {
        self.inner.state.lock().await.queue.history()
    }

    /// Time `holder_id` may keep the lock.
    ///
    /// `None` if it is not the holder; `Duration::MAX` when timeouts are
    /// disabled.
    pub async fn remaining_time(&self, holder_id: &str) -> Option<Duration> {
        let mut state = self.inner.state.lock().await;
        if !state.locks.is_held_by(holder_id) {
            return None;
        }
        if !self.inner.config.enable_auto_timeout {
            return Some(Duration::MAX);
        }
        state.timeouts.remaining(holder_id)
    }

    /// Replace the holder's deadline with `duration` from now.
    ///
    /// The new limit is written to the lock record, so a restart judges the
    /// lock against it. Returns `false` when `holder_id` is not the holder or
    /// timeouts are disabled.
    pub async fn extend_timeout(&self, holder_id: &str, duration: Duration) -> bool {
        let mut state = self.inner.state.lock().await;
        if !self.inner.config.enable_auto_timeout {
            return false;
        }
        let Some(lock) = state
            .locks
            .current_lock()
            .filter(|lock| lock.holder_id == holder_id)
        else {
            return false;
        };
        state
            .locks
            .set_max_duration(holder_id, lock.age(Utc::now()) + duration);
        if !state.timeouts.extend(holder_id, duration) {
            // Recovered lock with no armed timer.
            state.timeouts.schedule(holder_id, duration);
        }
        info!(holder = %holder_id, ?duration, "execution timeout extended");
        true
    }

    /// Cancel all timers and flush pending publishes.
    ///
    /// The scheduler stays usable afterwards but no longer publishes.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.timeouts.cancel_all();
        if let Some(mut worker) = state.publisher.take() {
            worker.close().await;
        }
        info!("execution scheduler shut down");
    }

    // ── Internals ─────────────────────────────────────────────

    async fn recover(&self) {
        let mut state = self.inner.state.lock().await;

        // Discarded on load because it outlived its own recorded limit.
        if let Some(stale) = state.locks.take_stale() {
            warn!(holder = %stale.holder_id, "stale lock on startup");
            self.retire(&mut state, stale, EndReason::Timeout, Some("stale lock on startup"));
        }

        if let Some(lock) = state.locks.current_lock() {
            if let Some(max) = lock
                .max_duration()
                .or_else(|| self.inner.config.max_execution_duration())
                .filter(|_| self.inner.config.enable_auto_timeout)
            {
                let age = lock.age(Utc::now());
                if age > max {
                    warn!(holder = %lock.holder_id, ?age, "stale lock on startup");
                    self.finish(
                        &mut state,
                        &lock.holder_id,
                        EndReason::Timeout,
                        Some("stale lock on startup"),
                    );
                } else {
                    state.timeouts.schedule(&lock.holder_id, max - age);
                }
            }
        }

        if state.locks.current_lock().is_none() && !state.queue.is_empty() {
            self.promote(&mut state);
        }
        self.publish_status(&mut state);
    }

    /// Take the lock for `holder_id` and arm its timeout.
    fn grant(&self, state: &mut State, holder_id: &str, requester_id: &str) -> bool {
        if !state.locks.acquire(holder_id, requester_id) {
            return false;
        }
        if let Some(max) = self.inner.config.max_execution_duration() {
            state.timeouts.schedule(holder_id, max);
        }
        self.inner.events.emit(SchedulerEvent::LockAcquired {
            holder_id: holder_id.to_string(),
            requester_id: requester_id.to_string(),
        });
        true
    }

    /// Hand a free lock to the queue head, skipping entries that cannot be
    /// granted.
    fn promote(&self, state: &mut State) {
        while state.locks.current_lock().is_none() {
            let Some(next) = state.queue.dequeue() else {
                break;
            };
            self.inner.events.emit(SchedulerEvent::QueueLeft {
                holder_id: next.holder_id.clone(),
            });
            if self.grant(state, &next.holder_id, &next.requester_id) {
                info!(holder = %next.holder_id, "promoted from execution queue");
                break;
            }
            warn!(holder = %next.holder_id, "promotion failed, trying next entry");
        }
    }

    /// Release pipeline shared by every way an execution can end.
    fn finish(
        &self,
        state: &mut State,
        holder_id: &str,
        reason: EndReason,
        forced_by: Option<&str>,
    ) -> bool {
        let Some(lock) = state
            .locks
            .current_lock()
            .filter(|lock| lock.holder_id == holder_id)
        else {
            debug!(holder = %holder_id, %reason, "release ignored, not the lock holder");
            return false;
        };
        state.timeouts.cancel(holder_id);
        state.locks.release(holder_id);
        self.retire(state, lock, reason, forced_by);
        true
    }

    /// Record, announce and hand on a lock that is no longer held.
    fn retire(
        &self,
        state: &mut State,
        lock: ExecutionLock,
        reason: EndReason,
        forced_by: Option<&str>,
    ) {
        let record = ExecutionHistoryRecord::from_lock(&lock, reason);
        let duration = record.duration();
        state.queue.record_history(record);
        info!(holder = %lock.holder_id, %reason, ?duration, "execution ended");

        self.inner.events.emit(SchedulerEvent::LockReleased {
            holder_id: lock.holder_id.clone(),
            reason,
        });
        if let (Some(why), Some(worker)) = (forced_by, &state.publisher) {
            worker.submit(PublishRequest::ForcedRelease(ForcedReleaseNotice {
                holder_id: lock.holder_id,
                reason: why.to_string(),
                released_by: self.inner.operator.clone(),
                timestamp: Utc::now(),
            }));
        }

        self.promote(state);
        self.publish_status(state);
    }

    fn publish_status(&self, state: &mut State) {
        if state.publisher.is_none() {
            return;
        }
        let snapshot = StatusSnapshot {
            active: state.locks.current_lock(),
            queued: state.queue.entries(),
            estimated_wait_secs: state.queue.estimated_wait().as_secs(),
            timestamp: Utc::now(),
        };
        if let Some(worker) = &state.publisher {
            worker.submit(PublishRequest::Status(snapshot));
        }
    }

    async fn on_timeout_signal(&self, signal: TimeoutSignal) {
        let mut state = self.inner.state.lock().await;
        match signal {
            TimeoutSignal::Warning {
                holder_id,
                remaining,
                generation,
            } => {
                if !state.timeouts.is_current(&holder_id, generation) {
                    return;
                }
                warn!(holder = %holder_id, ?remaining, "execution approaching timeout");
                self.inner.events.emit(SchedulerEvent::TimeoutWarning {
                    holder_id,
                    remaining_ms: remaining.as_millis() as u64,
                });
            }
            TimeoutSignal::Expired {
                holder_id,
                generation,
            } => {
                if !state.timeouts.complete(&holder_id, generation) {
                    debug!(holder = %holder_id, generation, "ignoring superseded timeout");
                    return;
                }
                warn!(holder = %holder_id, "execution timed out");
                self.inner.events.emit(SchedulerEvent::Timeout {
                    holder_id: holder_id.clone(),
                });
                self.finish(
                    &mut state,
                    &holder_id,
                    EndReason::Timeout,
                    Some("execution timeout"),
                );
            }
        }
    }
}

/// Route timer signals back into the scheduler without keeping it alive.
fn spawn_timeout_reactor(inner: Weak<Inner>, mut signals: mpsc::UnboundedReceiver<TimeoutSignal>) {
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            ExecutionScheduler { inner }.on_timeout_signal(signal).await;
        }
    });
}
