//! Exclusive, FIFO-fair execution rights for a shared conversation.
//!
//! This crate provides:
//! - `LockManager`: the persisted "who holds execution rights" fact
//! - `QueueManager`: the FIFO wait list, execution history and wait estimates
//! - `TimeoutManager`: per-holder deadlines with an advance warning
//! - `ExecutionScheduler`: the public API composing all of the above
//! - `StatusPublisher` implementations for broadcasting scheduler state

pub mod error;
pub mod events;
pub mod lock;
pub mod publisher;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod timeout;
pub mod types;

pub use error::{PublishError, SchedulerError, StoreError};
pub use events::{EventBus, SchedulerEvent};
pub use lock::LockManager;
pub use publisher::{
    ForcedReleaseNotice, LogStatusPublisher, StatusPublisher, StatusSnapshot,
    WebhookStatusPublisher,
};
pub use queue::QueueManager;
pub use scheduler::{ExecutionScheduler, SchedulerBuilder};
pub use store::StateStore;
pub use timeout::{TimeoutManager, TimeoutSignal};
pub use types::*;
