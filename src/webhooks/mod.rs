//! Durable outgoing webhooks with an append-only attempt log.
//!
//! Events move `pending -> in_progress -> {succeeded, pending, failed}`. The
//! `pending -> in_progress` claim is the only coordination between workers,
//! so several dispatchers may drain the same store.

pub mod dispatcher;
pub mod pg_store;
pub mod redact;
pub mod store;
pub mod types;

pub use dispatcher::{backoff_delay, WebhookDispatcher};
pub use pg_store::PgWebhookStore;
pub use store::{MemoryWebhookStore, WebhookStore};
pub use types::{
    AttemptStatus, Direction, EnqueueRequest, EventQuery, EventStatus, Headers, ManualOutcome,
    WebhookAttempt, WebhookEvent,
};
