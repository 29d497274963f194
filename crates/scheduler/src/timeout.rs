//! Per-holder execution deadlines.
//!
//! Each armed holder gets one background task that sleeps until the warning
//! point, posts [`TimeoutSignal::Warning`], sleeps until the deadline and posts
//! [`TimeoutSignal::Expired`]. The manager never touches the lock itself; the
//! scheduler consumes the signals and runs the release pipeline.
//!
//! Timers live only in memory. After a restart the scheduler re-checks the
//! recovered lock's age instead.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutSignal {
    Warning {
        holder_id: String,
        remaining: Duration,
        generation: u64,
    },
    Expired {
        holder_id: String,
        generation: u64,
    },
}

struct ArmedTimer {
    /// Distinguishes this arming from earlier ones for the same holder.
    generation: u64,
    deadline: Instant,
    task: JoinHandle<()>,
}

pub struct TimeoutManager {
    warning_lead: Duration,
    timers: HashMap<String, ArmedTimer>,
    next_generation: u64,
    signals: mpsc::UnboundedSender<TimeoutSignal>,
}

impl TimeoutManager {
    /// Create a manager and the receiving end of its signal channel.
    pub fn new(warning_lead: Duration) -> (Self, mpsc::UnboundedReceiver<TimeoutSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let manager = Self {
            warning_lead,
            timers: HashMap::new(),
            next_generation: 0,
            signals,
        };
        (manager, rx)
    }

    /// Arm (or re-arm) the deadline for `holder_id`, `duration` from now.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule(&mut self, holder_id: &str, duration: Duration) {
        self.cancel(holder_id);

        self.next_generation += 1;
        let generation = self.next_generation;
        let deadline = Instant::now() + duration;
        let warning_lead = (duration > self.warning_lead).then_some(self.warning_lead);
        let tx = self.signals.clone();
        let holder = holder_id.to_string();

        let task = tokio::spawn(async move {
            if let Some(lead) = warning_lead {
                tokio::time::sleep_until(deadline - lead).await;
                let _ = tx.send(TimeoutSignal::Warning {
                    holder_id: holder.clone(),
                    remaining: lead,
                    generation,
                });
            }
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(TimeoutSignal::Expired {
                holder_id: holder,
                generation,
            });
        });

        debug!(holder = %holder_id, ?duration, generation, "execution timeout armed");
        self.timers.insert(
            holder_id.to_string(),
            ArmedTimer {
                generation,
                deadline,
                task,
            },
        );
    }

    /// Cancel pending warning and expiry for `holder_id`.
    pub fn cancel(&mut self, holder_id: &str) -> bool {
        match self.timers.remove(holder_id) {
            Some(timer) => {
                timer.task.abort();
                debug!(holder = %holder_id, "execution timeout cancelled");
                true
            }
            None => false,
        }
    }

    /// Replace an armed holder's deadline with `duration` from now.
    ///
    /// Returns `false` if the holder has no armed timer.
    pub fn extend(&mut self, holder_id: &str, duration: Duration) -> bool {
        if !self.timers.contains_key(holder_id) {
            return false;
        }
        self.schedule(holder_id, duration);
        true
    }

    /// Time left before `holder_id` expires, if armed.
    pub fn remaining(&self, holder_id: &str) -> Option<Duration> {
        self.timers
            .get(holder_id)
            .map(|t| t.deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether `generation` is the live arming for `holder_id`.
    pub fn is_current(&self, holder_id: &str, generation: u64) -> bool {
        self.timers
            .get(holder_id)
            .map(|t| t.generation == generation)
            .unwrap_or(false)
    }

    /// Forget a timer that has fired. Stale generations are ignored.
    pub fn complete(&mut self, holder_id: &str, generation: u64) -> bool {
        if self.is_current(holder_id, generation) {
            self.timers.remove(holder_id);
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn armed_count(&self) -> usize {
        self.timers.len()
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
    }
}

impl Drop for TimeoutManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
