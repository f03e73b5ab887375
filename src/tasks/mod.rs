//! Cron-scheduled background work: mailbox polls and webhook sweeps.

pub mod schedule;
pub mod scheduler;
pub mod store;

pub use schedule::{normalize_cron, parse_cron};
pub use scheduler::{run_webhook_sweeps, RefreshHandle, TaskFuture, TaskHandler, TaskScheduler};
pub use store::{
    MemoryScheduledTaskStore, NewScheduledTask, PgScheduledTaskStore, ScheduledTask,
    ScheduledTaskStore,
};

/// `task_type` of the rows owned by mailbox accounts.
pub const IMAP_POLL_TASK: &str = "imap_poll";
