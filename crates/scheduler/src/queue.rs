//! FIFO wait queue and execution history.
//!
//! [`QueueManager`] owns the ordered list of holders waiting for the lock and a
//! capped log of finished executions. Both are rewritten to disk after every
//! mutation and reloaded on construction, dropping entries that no longer
//! parse instead of failing startup.

use std::collections::VecDeque;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::store::{StateStore, HISTORY_FILE, QUEUE_FILE};
use crate::types::{EndReason, ExecutionHistoryRecord, QueueEntry};

/// Completed executions averaged for wait estimates.
const ESTIMATE_WINDOW: usize = 50;

/// Assumed execution length when there is no history yet.
const DEFAULT_EXECUTION_SECS: f64 = 600.0;

pub struct QueueManager {
    store: StateStore,
    entries: VecDeque<QueueEntry>,
    history: VecDeque<ExecutionHistoryRecord>,
    max_queue_size: usize,
    max_history_size: usize,
}

impl QueueManager {
    /// Create a manager and load any persisted queue and history.
    pub fn new(store: StateStore, max_queue_size: usize, max_history_size: usize) -> Self {
        let entries: VecDeque<QueueEntry> = load_valid(&store, QUEUE_FILE).into();
        let mut history: VecDeque<ExecutionHistoryRecord> =
            load_valid(&store, HISTORY_FILE).into();
        while history.len() > max_history_size {
            history.pop_front();
        }
        if !entries.is_empty() || !history.is_empty() {
            info!(
                queued = entries.len(),
                history = history.len(),
                "recovered execution queue"
            );
        }
        Self {
            store,
            entries,
            history,
            max_queue_size,
            max_history_size,
        }
    }

    /// Add `holder_id` to the back of the queue and return its 1-based position.
    ///
    /// A holder already in the queue keeps its place.
    pub fn enqueue(&mut self, holder_id: &str, requester_id: &str) -> Result<usize, SchedulerError> {
        let existing = self.position(holder_id);
        if existing > 0 {
            debug!(holder = %holder_id, position = existing, "already queued");
            return Ok(existing);
        }
        if self.entries.len() >= self.max_queue_size {
            warn!(holder = %holder_id, max = self.max_queue_size, "execution queue full");
            return Err(SchedulerError::QueueFull {
                max_size: self.max_queue_size,
            });
        }
        self.entries.push_back(QueueEntry::new(holder_id, requester_id));
        self.persist();
        let position = self.entries.len();
        info!(holder = %holder_id, position, "joined execution queue");
        Ok(position)
    }

    /// Pop the head of the queue.
    pub fn dequeue(&mut self) -> Option<QueueEntry> {
        let entry = self.entries.pop_front()?;
        self.persist();
        Some(entry)
    }

    /// Withdraw a waiting holder from anywhere in the queue.
    pub fn remove(&mut self, holder_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.holder_id != holder_id);
        let removed = self.entries.len() != before;
        if removed {
            self.persist();
            info!(holder = %holder_id, "left execution queue");
        }
        removed
    }

    /// 1-based position of `holder_id`, or 0 when it is not queued.
    pub fn position(&self, holder_id: &str) -> usize {
        self.entries
            .iter()
            .position(|e| e.holder_id == holder_id)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    pub fn entries(&self) -> Vec<QueueEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every waiting entry and return them in queue order.
    pub fn clear(&mut self) -> Vec<QueueEntry> {
        let drained: Vec<_> = self.entries.drain(..).collect();
        if !drained.is_empty() {
            self.persist();
            info!(count = drained.len(), "execution queue cleared");
        }
        drained
    }

    /// Append a finished execution, evicting the oldest past the cap.
    pub fn record_history(&mut self, record: ExecutionHistoryRecord) {
        self.history.push_back(record);
        while self.history.len() > self.max_history_size {
            self.history.pop_front();
        }
        self.persist();
    }

    pub fn history(&self) -> Vec<ExecutionHistoryRecord> {
        self.history.iter().cloned().collect()
    }

    /// Best-effort estimate of how long the newest queue entry will wait.
    ///
    /// Average duration of the last 50 completed executions (600s when there
    /// are none), times half a slot for the running holder plus one slot for
    /// every entry ahead of the newest.
    pub fn estimated_wait(&self) -> Duration {
        let completed: Vec<f64> = self
            .history
            .iter()
            .rev()
            .filter(|r| r.end_reason == EndReason::Completed)
            .take(ESTIMATE_WINDOW)
            .map(|r| r.duration().as_secs_f64())
            .collect();
        let average = if completed.is_empty() {
            DEFAULT_EXECUTION_SECS
        } else {
            completed.iter().sum::<f64>() / completed.len() as f64
        };
        let slots_ahead = self.entries.len().saturating_sub(1) as f64;
        Duration::from_secs_f64(average * (0.5 + slots_ahead))
    }

    fn persist(&self) {
        if let Err(e) = self.store.write(QUEUE_FILE, &self.entries) {
            warn!(error = %e, "failed to persist execution queue, continuing in memory");
        }
        if let Err(e) = self.store.write(HISTORY_FILE, &self.history) {
            warn!(error = %e, "failed to persist execution history, continuing in memory");
        }
    }
}

/// Load a JSON array, keeping only the elements that decode as `T`.
fn load_valid<T: DeserializeOwned + Serialize>(store: &StateStore, name: &str) -> Vec<T> {
    let raw = match store.read::<Vec<serde_json::Value>>(name) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!(file = name, error = %e, "unreadable state file, starting empty");
            return Vec::new();
        }
    };
    let total = raw.len();
    let valid: Vec<T> = raw
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect();
    if valid.len() < total {
        warn!(file = name, dropped = total - valid.len(), "dropped invalid persisted entries");
    }
    valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> QueueManager {
        QueueManager::new(StateStore::open(tmp.path()).unwrap(), 100, 1000)
    }

    fn record(holder: &str, secs: i64, reason: EndReason) -> ExecutionHistoryRecord {
        let ended_at = Utc::now();
        ExecutionHistoryRecord {
            holder_id: holder.to_string(),
            requester_id: "agent".to_string(),
            started_at: ended_at - chrono::Duration::seconds(secs),
            ended_at,
            end_reason: reason,
        }
    }

    #[test]
    fn enqueue_returns_fifo_positions() {
        let tmp = TempDir::new().unwrap();
        let mut queue = manager(&tmp);
        assert_eq!(queue.enqueue("conv-2", "a").unwrap(), 1);
        assert_eq!(queue.enqueue("conv-3", "b").unwrap(), 2);
        assert_eq!(queue.enqueue("conv-4", "c").unwrap(), 3);
        assert_eq!(queue.dequeue().unwrap().holder_id, "conv-2");
        assert_eq!(queue.dequeue().unwrap().holder_id, "conv-3");
        assert_eq!(queue.dequeue().unwrap().holder_id, "conv-4");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn re_enqueue_keeps_existing_position() {
        let tmp = TempDir::new().unwrap();
        let mut queue = manager(&tmp);
        queue.enqueue("conv-2", "a").unwrap();
        queue.enqueue("conv-3", "b").unwrap();
        assert_eq!(queue.enqueue("conv-2", "a").unwrap(), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn full_queue_rejects_and_stays_unchanged() {
        let mut queue = QueueManager::new(StateStore::disabled(), 2, 10);
        queue.enqueue("conv-1", "a").unwrap();
        queue.enqueue("conv-2", "a").unwrap();
        let before = queue.entries();

        let err = queue.enqueue("conv-3", "a").unwrap_err();
        assert!(matches!(err, SchedulerError::QueueFull { max_size: 2 }));
        assert_eq!(queue.entries(), before);
        assert_eq!(queue.position("conv-3"), 0);
    }

    #[test]
    fn already_queued_holder_succeeds_when_full() {
        let mut queue = QueueManager::new(StateStore::disabled(), 1, 10);
        queue.enqueue("conv-1", "a").unwrap();
        assert_eq!(queue.enqueue("conv-1", "a").unwrap(), 1);
    }

    #[test]
    fn remove_shifts_later_entries_forward() {
        let tmp = TempDir::new().unwrap();
        let mut queue = manager(&tmp);
        queue.enqueue("conv-2", "a").unwrap();
        queue.enqueue("conv-3", "b").unwrap();
        assert!(queue.remove("conv-2"));
        assert_eq!(queue.position("conv-3"), 1);
        assert_eq!(queue.position("conv-2"), 0);
        assert!(!queue.remove("conv-2"));
    }

    #[test]
    fn queue_and_history_survive_restart() {
        let tmp = TempDir::new().unwrap();
        {
            let mut queue = manager(&tmp);
            queue.enqueue("conv-2", "a").unwrap();
            queue.enqueue("conv-3", "b").unwrap();
            queue.record_history(record("conv-1", 30, EndReason::Completed));
        }
        let queue = manager(&tmp);
        assert_eq!(queue.position("conv-2"), 1);
        assert_eq!(queue.position("conv-3"), 2);
        assert_eq!(queue.history().len(), 1);
        assert_eq!(queue.history()[0].end_reason, EndReason::Completed);
    }

    #[test]
    fn invalid_persisted_entries_are_filtered() {
        let tmp = TempDir::new().unwrap();
        let raw = r#"[
            {"conversationId":"conv-2","agentPubkey":"a","timestamp":1700000000000,"retryCount":0},
            {"agentPubkey":"b","timestamp":1700000000000},
            {"conversationId":"conv-4","agentPubkey":"c","timestamp":1700000000001,"retryCount":1}
        ]"#;
        std::fs::write(tmp.path().join(QUEUE_FILE), raw).unwrap();
        std::fs::write(tmp.path().join(HISTORY_FILE), "garbage").unwrap();

        let queue = manager(&tmp);
        let holders: Vec<_> = queue.entries().into_iter().map(|e| e.holder_id).collect();
        assert_eq!(holders, vec!["conv-2", "conv-4"]);
        assert!(queue.history().is_empty());
    }

    #[test]
    fn history_is_capped() {
        let mut queue = QueueManager::new(StateStore::disabled(), 10, 3);
        for i in 0..5 {
            queue.record_history(record(&format!("conv-{i}"), 10, EndReason::Completed));
        }
        let history = queue.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].holder_id, "conv-2");
        assert_eq!(history[2].holder_id, "conv-4");
    }

    #[test]
    fn estimate_defaults_without_history() {
        let mut queue = QueueManager::new(StateStore::disabled(), 10, 10);
        queue.enqueue("conv-2", "a").unwrap();
        assert_eq!(queue.estimated_wait(), Duration::from_secs(300));
        queue.enqueue("conv-3", "a").unwrap();
        assert_eq!(queue.estimated_wait(), Duration::from_secs(900));
    }

    #[test]
    fn estimate_averages_completed_executions_only() {
        let mut queue = QueueManager::new(StateStore::disabled(), 10, 100);
        queue.record_history(record("a", 100, EndReason::Completed));
        queue.record_history(record("b", 300, EndReason::Completed));
        queue.record_history(record("c", 5000, EndReason::Timeout));
        queue.record_history(record("d", 5000, EndReason::Forced));
        queue.enqueue("conv-2", "a").unwrap();
        queue.enqueue("conv-3", "a").unwrap();
        // average 200s, 0.5 + 1 slots
        assert_eq!(queue.estimated_wait().as_secs(), 300);
    }

    #[test]
    fn estimate_uses_most_recent_window() {
        let mut queue = QueueManager::new(StateStore::disabled(), 10, 1000);
        for _ in 0..100 {
            queue.record_history(record("old", 1000, EndReason::Completed));
        }
        for _ in 0..ESTIMATE_WINDOW {
            queue.record_history(record("new", 20, EndReason::Completed));
        }
        queue.enqueue("conv-2", "a").unwrap();
        assert_eq!(queue.estimated_wait().as_secs(), 10);
    }

    #[test]
    fn clear_returns_drained_entries() {
        let mut queue = QueueManager::new(StateStore::disabled(), 10, 10);
        queue.enqueue("conv-2", "a").unwrap();
        queue.enqueue("conv-3", "a").unwrap();
        let drained = queue.clear();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
