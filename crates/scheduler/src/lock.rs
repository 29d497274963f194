//! Ownership of the execution lock.
//!
//! [`LockManager`] holds the single `ExecutionLock` for a project and mirrors
//! every change to `execution-lock.json`. The in-memory value is the source of
//! truth: failed writes are logged and the call still succeeds.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::{StateStore, LOCK_FILE};
use crate::types::ExecutionLock;

/// On-disk form of the lock, tagged with the project it belongs to.
#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    #[serde(flatten)]
    lock: ExecutionLock,
    #[serde(rename = "projectPath")]
    project_path: String,
}

pub struct LockManager {
    store: StateStore,
    /// Project scope; persisted locks from any other scope are ignored.
    scope: String,
    max_duration: Option<Duration>,
    current: Option<ExecutionLock>,
    /// Stale lock dropped during hydration, kept until the scheduler retires it.
    stale: Option<ExecutionLock>,
    hydrated: bool,
}

impl LockManager {
    /// Create a manager. Nothing is read until the lock is first accessed.
    ///
    /// `max_duration` is stamped onto every lock granted by this manager.
    pub fn new(store: StateStore, scope: impl Into<String>, max_duration: Option<Duration>) -> Self {
        Self {
            store,
            scope: scope.into(),
            max_duration,
            current: None,
            stale: None,
            hydrated: false,
        }
    }

    /// Current lock, loading it from disk on first access.
    pub fn current_lock(&mut self) -> Option<ExecutionLock> {
        if !self.hydrated {
            self.current = self.load();
            self.hydrated = true;
        }
        self.current.clone()
    }

    pub fn is_held_by(&mut self, holder_id: &str) -> bool {
        self.current_lock()
            .map(|lock| lock.holder_id == holder_id)
            .unwrap_or(false)
    }

    /// Take the lock for `holder_id`.
    ///
    /// Returns `true` if the lock was free or is already held by `holder_id`,
    /// `false` if someone else holds it.
    pub fn acquire(&mut self, holder_id: &str, requester_id: &str) -> bool {
        match self.current_lock() {
            Some(lock) if lock.holder_id == holder_id => {
                debug!(holder = %holder_id, "lock already held by requester");
                true
            }
            Some(lock) => {
                debug!(holder = %lock.holder_id, requested_by = %holder_id, "lock busy");
                false
            }
            None => {
                let lock = ExecutionLock::new(holder_id, requester_id, self.max_duration);
                self.current = Some(lock);
                self.persist();
                info!(holder = %holder_id, requester = %requester_id, "execution lock acquired");
                true
            }
        }
    }

    /// Release the lock if `holder_id` holds it. Anything else is a no-op.
    pub fn release(&mut self, holder_id: &str) -> bool {
        if !self.is_held_by(holder_id) {
            debug!(holder = %holder_id, "release ignored, not the lock holder");
            return false;
        }
        self.current = None;
        self.persist();
        info!(holder = %holder_id, "execution lock released");
        true
    }

    /// Clear whatever lock exists and return the evicted holder.
    pub fn force_release_any(&mut self) -> Option<String> {
        let evicted = self.current_lock()?;
        self.current = None;
        self.persist();
        warn!(holder = %evicted.holder_id, "execution lock force-released");
        Some(evicted.holder_id)
    }

    fn load(&mut self) -> Option<ExecutionLock> {
        let record = match self.store.read::<LockRecord>(LOCK_FILE) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "unreadable lock file, treating as unlocked");
                return None;
            }
        };

        if record.project_path != self.scope {
            warn!(
                holder = %record.lock.holder_id,
                lock_scope = %record.project_path,
                scope = %self.scope,
                "discarding lock from another project"
            );
            return None;
        }

        if record.lock.is_stale(Utc::now()) {
            warn!(
                holder = %record.lock.holder_id,
                acquired_at = %record.lock.acquired_at,
                "discarding stale lock"
            );
            if let Err(e) = self.store.remove(LOCK_FILE) {
                warn!(error = %e, "failed to remove stale lock file");
            }
            self.stale = Some(record.lock);
            return None;
        }

        info!(holder = %record.lock.holder_id, "recovered execution lock");
        Some(record.lock)
    }

    /// Stale lock discarded on first access, handed out once.
    pub fn take_stale(&mut self) -> Option<ExecutionLock> {
        self.current_lock();
        self.stale.take()
    }

    /// Raise the holder's recorded maximum duration to `max_duration`
    /// (measured from acquisition). Returns `false` if `holder_id` does not
    /// hold the lock.
    pub fn set_max_duration(&mut self, holder_id: &str, max_duration: Duration) -> bool {
        let Some(lock) = self
            .current
            .as_mut()
            .filter(|lock| lock.holder_id == holder_id)
        else {
            return false;
        };
        lock.max_duration_ms = Some(max_duration.as_millis() as u64);
        self.persist();
        true
    }

    fn persist(&self) {
        let result = match &self.current {
            Some(lock) => self.store.write(
                LOCK_FILE,
                &LockRecord {
                    lock: lock.clone(),
                    project_path: self.scope.clone(),
                },
            ),
            None => self.store.remove(LOCK_FILE),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to persist execution lock, continuing in memory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SCOPE: &str = "/work/project";

    fn manager(tmp: &TempDir) -> LockManager {
        LockManager::new(StateStore::open(tmp.path()).unwrap(), SCOPE, None)
    }

    #[test]
    fn acquire_free_lock() {
        let tmp = TempDir::new().unwrap();
        let mut locks = manager(&tmp);
        assert!(locks.current_lock().is_none());
        assert!(locks.acquire("conv-1", "agent-a"));
        let lock = locks.current_lock().unwrap();
        assert_eq!(lock.holder_id, "conv-1");
        assert_eq!(lock.requester_id, "agent-a");
    }

    #[test]
    fn reacquire_by_holder_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut locks = manager(&tmp);
        assert!(locks.acquire("conv-1", "agent-a"));
        let first = locks.current_lock().unwrap();
        assert!(locks.acquire("conv-1", "agent-a"));
        assert_eq!(locks.current_lock().unwrap(), first);
    }

    #[test]
    fn first_acquirer_wins() {
        let tmp = TempDir::new().unwrap();
        let mut locks = manager(&tmp);
        assert!(locks.acquire("conv-1", "agent-a"));
        assert!(!locks.acquire("conv-2", "agent-b"));
        assert!(!locks.acquire("conv-3", "agent-c"));
        assert_eq!(locks.current_lock().unwrap().holder_id, "conv-1");
    }

    #[test]
    fn release_by_non_holder_is_noop() {
        let tmp = TempDir::new().unwrap();
        let mut locks = manager(&tmp);
        assert!(!locks.release("conv-1"));
        locks.acquire("conv-1", "agent-a");
        assert!(!locks.release("conv-2"));
        assert!(locks.is_held_by("conv-1"));
        assert!(locks.release("conv-1"));
        assert!(locks.current_lock().is_none());
        assert!(!tmp.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn force_release_any_returns_evicted_holder() {
        let tmp = TempDir::new().unwrap();
        let mut locks = manager(&tmp);
        assert_eq!(locks.force_release_any(), None);
        locks.acquire("conv-9", "agent-a");
        assert_eq!(locks.force_release_any(), Some("conv-9".to_string()));
        assert!(locks.current_lock().is_none());
    }

    #[test]
    fn lock_survives_restart() {
        let tmp = TempDir::new().unwrap();
        manager(&tmp).acquire("conv-1", "agent-a");

        let mut restarted = manager(&tmp);
        assert_eq!(restarted.current_lock().unwrap().holder_id, "conv-1");
        assert!(!restarted.acquire("conv-2", "agent-b"));
    }

    #[test]
    fn persisted_file_carries_project_path() {
        let tmp = TempDir::new().unwrap();
        manager(&tmp).acquire("conv-1", "agent-a");
        let raw = std::fs::read_to_string(tmp.path().join(LOCK_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["projectPath"], SCOPE);
        assert_eq!(json["conversationId"], "conv-1");
    }

    #[test]
    fn foreign_lock_is_discarded() {
        let tmp = TempDir::new().unwrap();
        manager(&tmp).acquire("conv-1", "agent-a");

        let mut other = LockManager::new(StateStore::open(tmp.path()).unwrap(), "/other", None);
        assert!(other.current_lock().is_none());
        assert!(other.acquire("conv-2", "agent-b"));
    }

    #[test]
    fn stale_lock_is_discarded_on_first_access() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        let mut lock = ExecutionLock::new("conv-old", "agent-a", Some(Duration::from_secs(60)));
        lock.acquired_at = Utc::now() - chrono::Duration::minutes(5);
        store
            .write(
                LOCK_FILE,
                &LockRecord {
                    lock,
                    project_path: SCOPE.to_string(),
                },
            )
            .unwrap();

        let mut locks = manager(&tmp);
        assert!(locks.current_lock().is_none());
        assert!(!tmp.path().join(LOCK_FILE).exists());

        assert_eq!(locks.take_stale().unwrap().holder_id, "conv-old");
        assert!(locks.take_stale().is_none());
    }

    #[test]
    fn fresh_lock_has_nothing_stale() {
        let tmp = TempDir::new().unwrap();
        manager(&tmp).acquire("conv-1", "agent-a");
        let mut locks = manager(&tmp);
        assert!(locks.take_stale().is_none());
        assert!(locks.is_held_by("conv-1"));
    }

    #[test]
    fn raised_max_duration_is_persisted() {
        let tmp = TempDir::new().unwrap();
        let mut locks = LockManager::new(
            StateStore::open(tmp.path()).unwrap(),
            SCOPE,
            Some(Duration::from_secs(60)),
        );
        locks.acquire("conv-1", "agent-a");
        assert!(!locks.set_max_duration("conv-2", Duration::from_secs(600)));
        assert!(locks.set_max_duration("conv-1", Duration::from_secs(600)));

        let mut restarted = manager(&tmp);
        assert_eq!(
            restarted.current_lock().unwrap().max_duration(),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn corrupt_lock_file_reads_as_unlocked() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(LOCK_FILE), "{\"conversationId\":").unwrap();
        let mut locks = manager(&tmp);
        assert!(locks.current_lock().is_none());
        assert!(locks.acquire("conv-1", "agent-a"));
    }

    #[test]
    fn disabled_persistence_keeps_memory_state() {
        let mut locks = LockManager::new(StateStore::disabled(), SCOPE, None);
        assert!(locks.acquire("conv-1", "agent-a"));
        assert!(locks.is_held_by("conv-1"));

        let mut fresh = LockManager::new(StateStore::disabled(), SCOPE, None);
        assert!(fresh.current_lock().is_none());
    }

    #[test]
    fn granted_lock_records_max_duration() {
        let tmp = TempDir::new().unwrap();
        let mut locks = LockManager::new(
            StateStore::open(tmp.path()).unwrap(),
            SCOPE,
            Some(Duration::from_secs(300)),
        );
        locks.acquire("conv-1", "agent-a");
        assert_eq!(locks.current_lock().unwrap().max_duration_ms, Some(300_000));
    }
}
