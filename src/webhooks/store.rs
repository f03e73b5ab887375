use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::types::{
    Direction, EventOutcome, EventQuery, EventStatus, NewAttempt, NewWebhookEvent, WebhookAttempt,
    WebhookEvent,
};
use crate::core::error::{CoreError, CoreResult};

/// Durable event + attempt log. Status changes out of `pending` and
/// `in_progress` are compare-and-set on the current status.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn insert_event(&self, event: NewWebhookEvent) -> CoreResult<WebhookEvent>;

    async fn get_event(&self, id: i64) -> CoreResult<Option<WebhookEvent>>;

    async fn list_events(&self, query: &EventQuery) -> CoreResult<Vec<WebhookEvent>>;

    /// Outgoing pending events whose `next_attempt_at` has passed, oldest first.
    async fn due_events(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<i64>>;

    /// `pending -> in_progress`; `None` when the event is not pending.
    async fn claim(&self, id: i64, now: DateTime<Utc>) -> CoreResult<Option<WebhookEvent>>;

    /// Applies `outcome` to an `in_progress` event; `None` when it is in any other state.
    async fn complete(
        &self,
        id: i64,
        outcome: &EventOutcome,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<WebhookEvent>>;

    async fn record_attempt(&self, attempt: NewAttempt) -> CoreResult<WebhookAttempt>;

    async fn attempts(&self, event_id: i64) -> CoreResult<Vec<WebhookAttempt>>;

    async fn stalled_events(&self, updated_before: DateTime<Utc>) -> CoreResult<Vec<WebhookEvent>>;

    async fn delete_succeeded_before(&self, cutoff: DateTime<Utc>) -> CoreResult<usize>;

    /// Resets any event to `pending` due at `now`.
    async fn force_retry(&self, id: i64, now: DateTime<Utc>) -> CoreResult<WebhookEvent>;

    async fn delete_event(&self, id: i64) -> CoreResult<bool>;
}

#[derive(Default)]
struct MemoryState {
    next_event_id: i64,
    next_attempt_id: i64,
    events: BTreeMap<i64, WebhookEvent>,
    attempts: Vec<WebhookAttempt>,
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryWebhookStore {
    state: Mutex<MemoryState>,
}

impl MemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::internal("Webhook store lock poisoned"))
    }

    /// Moves `updated_at` back, as if the event had sat untouched.
    pub fn backdate(&self, id: i64, updated_at: DateTime<Utc>) -> CoreResult<()> {
        let mut state = self.lock()?;
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("Webhook event {id}")))?;
        event.updated_at = updated_at;
        Ok(())
    }

    pub fn snapshot(&self) -> CoreResult<Vec<WebhookEvent>> {
        Ok(self.lock()?.events.values().cloned().collect())
    }
}

#[async_trait]
impl WebhookStore for MemoryWebhookStore {
    async fn insert_event(&self, event: NewWebhookEvent) -> CoreResult<WebhookEvent> {
        let now = Utc::now();
        let mut state = self.lock()?;
        state.next_event_id += 1;
        let record = WebhookEvent {
            id: state.next_event_id,
            name: event.name,
            direction: event.direction,
            target_url: event.target_url,
            source_url: event.source_url,
            headers: event.headers,
            payload: event.payload,
            attempt_count: 0,
            max_attempts: event.max_attempts,
            backoff_seconds: event.backoff_seconds,
            status: event.status,
            next_attempt_at: None,
            last_error: None,
            response_status: None,
            response_body: None,
            created_at: now,
            updated_at: now,
        };
        state.events.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_event(&self, id: i64) -> CoreResult<Option<WebhookEvent>> {
        Ok(self.lock()?.events.get(&id).cloned())
    }

    async fn list_events(&self, query: &EventQuery) -> CoreResult<Vec<WebhookEvent>> {
        let state = self.lock()?;
        Ok(state
            .events
            .values()
            .rev()
            .filter(|e| query.accepts(e))
            .skip(query.offset() as usize)
            .take(query.limit() as usize)
            .cloned()
            .collect())
    }

    async fn due_events(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<i64>> {
        let state = self.lock()?;
        let mut due: Vec<&WebhookEvent> = state
            .events
            .values()
            .filter(|e| {
                e.direction == Direction::Outgoing
                    && e.status == EventStatus::Pending
                    && e.next_attempt_at.map_or(true, |at| at <= now)
            })
            .collect();
        due.sort_by_key(|e| (e.created_at, e.id));
        Ok(due.into_iter().take(limit.max(0) as usize).map(|e| e.id).collect())
    }

    async fn claim(&self, id: i64, now: DateTime<Utc>) -> CoreResult<Option<WebhookEvent>> {
        let mut state = self.lock()?;
        match state.events.get_mut(&id) {
            Some(event) if event.status == EventStatus::Pending => {
                event.status = EventStatus::InProgress;
                event.updated_at = now;
                Ok(Some(event.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete(
        &self,
        id: i64,
        outcome: &EventOutcome,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<WebhookEvent>> {
        let mut state = self.lock()?;
        match state.events.get_mut(&id) {
            Some(event) if event.status == EventStatus::InProgress => {
                event.status = outcome.status;
                event.attempt_count = outcome.attempt_count;
                event.next_attempt_at = outcome.next_attempt_at;
                event.last_error = outcome.last_error.clone();
                event.response_status = outcome.response_status;
                event.response_body = outcome.response_body.clone();
                event.updated_at = now;
                Ok(Some(event.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn record_attempt(&self, attempt: NewAttempt) -> CoreResult<WebhookAttempt> {
        let mut state = self.lock()?;
        if state
            .attempts
            .iter()
            .any(|a| a.event_id == attempt.event_id && a.attempt_number == attempt.attempt_number)
        {
            return Err(CoreError::Integrity(format!(
                "Attempt {} already recorded for event {}",
                attempt.attempt_number, attempt.event_id
            )));
        }
        state.next_attempt_id += 1;
        let record = WebhookAttempt {
            id: state.next_attempt_id,
            event_id: attempt.event_id,
            attempt_number: attempt.attempt_number,
            status: attempt.status,
            response_status: attempt.response_status,
            response_body: attempt.response_body,
            error_message: attempt.error_message,
            request_headers: attempt.request_headers,
            request_body: attempt.request_body,
            response_headers: attempt.response_headers,
            attempted_at: attempt.attempted_at,
        };
        state.attempts.push(record.clone());
        Ok(record)
    }

    async fn attempts(&self, event_id: i64) -> CoreResult<Vec<WebhookAttempt>> {
        let state = self.lock()?;
        let mut attempts: Vec<WebhookAttempt> = state
            .attempts
            .iter()
            .filter(|a| a.event_id == event_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn stalled_events(&self, updated_before: DateTime<Utc>) -> CoreResult<Vec<WebhookEvent>> {
        Ok(self
            .lock()?
            .events
            .values()
            .filter(|e| e.status == EventStatus::InProgress && e.updated_at < updated_before)
            .cloned()
            .collect())
    }

    async fn delete_succeeded_before(&self, cutoff: DateTime<Utc>) -> CoreResult<usize> {
        let mut state = self.lock()?;
        let doomed: Vec<i64> = state
            .events
            .values()
            .filter(|e| e.status == EventStatus::Succeeded && e.updated_at < cutoff)
            .map(|e| e.id)
            .collect();
        for id in &doomed {
            state.events.remove(id);
        }
        state.attempts.retain(|a| !doomed.contains(&a.event_id));
        Ok(doomed.len())
    }

    async fn force_retry(&self, id: i64, now: DateTime<Utc>) -> CoreResult<WebhookEvent> {
        let mut state = self.lock()?;
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("Webhook event {id}")))?;
        event.status = EventStatus::Pending;
        event.next_attempt_at = Some(now);
        event.updated_at = now;
        Ok(event.clone())
    }

    async fn delete_event(&self, id: i64) -> CoreResult<bool> {
        let mut state = self.lock()?;
        let removed = state.events.remove(&id).is_some();
        state.attempts.retain(|a| a.event_id != id);
        Ok(removed)
    }
}
