use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;

use super::store::WebhookStore;
use super::types::{
    EventOutcome, EventQuery, EventStatus, Headers, NewAttempt, NewWebhookEvent, WebhookAttempt,
    WebhookEvent,
};
use crate::core::error::{CoreError, CoreResult};
use crate::core::shared::schema::{webhook_attempts, webhook_events};
use crate::core::shared::utils::{with_conn, DbPool};

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = webhook_events)]
struct EventRow {
    id: i64,
    name: String,
    direction: String,
    target_url: Option<String>,
    source_url: Option<String>,
    headers: Value,
    payload: Value,
    attempt_count: i32,
    max_attempts: i32,
    backoff_seconds: i32,
    status: String,
    next_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    response_status: Option<i32>,
    response_body: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for WebhookEvent {
    type Error = CoreError;

    fn try_from(row: EventRow) -> CoreResult<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            direction: row.direction.parse()?,
            target_url: row.target_url,
            source_url: row.source_url,
            headers: headers_from_json(row.headers),
            payload: row.payload,
            attempt_count: row.attempt_count,
            max_attempts: row.max_attempts,
            backoff_seconds: row.backoff_seconds,
            status: row.status.parse()?,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            response_status: row.response_status,
            response_body: row.response_body,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = webhook_events)]
struct NewEventRow {
    name: String,
    direction: String,
    target_url: Option<String>,
    source_url: Option<String>,
    headers: Value,
    payload: Value,
    max_attempts: i32,
    backoff_seconds: i32,
    status: String,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = webhook_attempts)]
struct AttemptRow {
    id: i64,
    event_id: i64,
    attempt_number: i32,
    status: String,
    response_status: Option<i32>,
    response_body: Option<String>,
    error_message: Option<String>,
    request_headers: Value,
    request_body: Option<String>,
    response_headers: Value,
    attempted_at: DateTime<Utc>,
}

impl TryFrom<AttemptRow> for WebhookAttempt {
    type Error = CoreError;

    fn try_from(row: AttemptRow) -> CoreResult<Self> {
        Ok(Self {
            id: row.id,
            event_id: row.event_id,
            attempt_number: row.attempt_number,
            status: row.status.parse()?,
            response_status: row.response_status,
            response_body: row.response_body,
            error_message: row.error_message,
            request_headers: headers_from_json(row.request_headers),
            request_body: row.request_body,
            response_headers: headers_from_json(row.response_headers),
            attempted_at: row.attempted_at,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = webhook_attempts)]
struct NewAttemptRow {
    event_id: i64,
    attempt_number: i32,
    status: String,
    response_status: Option<i32>,
    response_body: Option<String>,
    error_message: Option<String>,
    request_headers: Value,
    request_body: Option<String>,
    response_headers: Value,
    attempted_at: DateTime<Utc>,
}

fn headers_from_json(value: Value) -> Headers {
    match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect(),
        _ => Headers::new(),
    }
}

fn headers_to_json(headers: &Headers) -> Value {
    Value::Object(
        headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn into_events(rows: Vec<EventRow>) -> CoreResult<Vec<WebhookEvent>> {
    rows.into_iter().map(WebhookEvent::try_from).collect()
}

#[derive(Clone)]
pub struct PgWebhookStore {
    pool: DbPool,
}

impl PgWebhookStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookStore for PgWebhookStore {
    async fn insert_event(&self, event: NewWebhookEvent) -> CoreResult<WebhookEvent> {
        let row = NewEventRow {
            name: event.name,
            direction: event.direction.as_str().to_string(),
            target_url: event.target_url,
            source_url: event.source_url,
            headers: headers_to_json(&event.headers),
            payload: event.payload,
            max_attempts: event.max_attempts,
            backoff_seconds: event.backoff_seconds,
            status: event.status.as_str().to_string(),
        };
        with_conn(&self.pool, move |conn| {
            let inserted: EventRow = diesel::insert_into(webhook_events::table)
                .values(&row)
                .returning(EventRow::as_returning())
                .get_result(conn)?;
            inserted.try_into()
        })
        .await
    }

    async fn get_event(&self, event_id: i64) -> CoreResult<Option<WebhookEvent>> {
        with_conn(&self.pool, move |conn| {
            webhook_events::table
                .find(event_id)
                .select(EventRow::as_select())
                .first(conn)
                .optional()?
                .map(WebhookEvent::try_from)
                .transpose()
        })
        .await
    }

    async fn list_events(&self, query: &EventQuery) -> CoreResult<Vec<WebhookEvent>> {
        use webhook_events::dsl;

        let query = query.clone();
        with_conn(&self.pool, move |conn| {
            let mut q = dsl::webhook_events.select(EventRow::as_select()).into_boxed();
            if let Some(status) = query.status {
                q = q.filter(dsl::status.eq(status.as_str()));
            }
            if let Some(direction) = query.direction {
                q = q.filter(dsl::direction.eq(direction.as_str()));
            }
            if let Some(name) = query.name.clone() {
                q = q.filter(dsl::name.eq(name));
            }
            let rows = q
                .order(dsl::id.desc())
                .limit(query.limit())
                .offset(query.offset())
                .load(conn)?;
            into_events(rows)
        })
        .await
    }

    async fn due_events(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<i64>> {
        use webhook_events::dsl;

        with_conn(&self.pool, move |conn| {
            Ok(dsl::webhook_events
                .filter(dsl::direction.eq("outgoing"))
                .filter(dsl::status.eq(EventStatus::Pending.as_str()))
                .filter(dsl::next_attempt_at.is_null().or(dsl::next_attempt_at.le(now)))
                .order((dsl::created_at.asc(), dsl::id.asc()))
                .limit(limit)
                .select(dsl::id)
                .load::<i64>(conn)?)
        })
        .await
    }

    async fn claim(&self, event_id: i64, now: DateTime<Utc>) -> CoreResult<Option<WebhookEvent>> {
        use webhook_events::dsl;

        with_conn(&self.pool, move |conn| {
            diesel::update(
                dsl::webhook_events
                    .filter(dsl::id.eq(event_id))
                    .filter(dsl::status.eq(EventStatus::Pending.as_str())),
            )
            .set((
                dsl::status.eq(EventStatus::InProgress.as_str()),
                dsl::updated_at.eq(now),
            ))
            .returning(EventRow::as_returning())
            .get_result(conn)
            .optional()?
            .map(WebhookEvent::try_from)
            .transpose()
        })
        .await
    }

    async fn complete(
        &self,
        event_id: i64,
        outcome: &EventOutcome,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<WebhookEvent>> {
        use webhook_events::dsl;

        let outcome = outcome.clone();
        with_conn(&self.pool, move |conn| {
            diesel::update(
                dsl::webhook_events
                    .filter(dsl::id.eq(event_id))
                    .filter(dsl::status.eq(EventStatus::InProgress.as_str())),
            )
            .set((
                dsl::status.eq(outcome.status.as_str()),
                dsl::attempt_count.eq(outcome.attempt_count),
                dsl::next_attempt_at.eq(outcome.next_attempt_at),
                dsl::last_error.eq(outcome.last_error),
                dsl::response_status.eq(outcome.response_status),
                dsl::response_body.eq(outcome.response_body),
                dsl::updated_at.eq(now),
            ))
            .returning(EventRow::as_returning())
            .get_result(conn)
            .optional()?
            .map(WebhookEvent::try_from)
            .transpose()
        })
        .await
    }

    async fn record_attempt(&self, attempt: NewAttempt) -> CoreResult<WebhookAttempt> {
        let row = NewAttemptRow {
            event_id: attempt.event_id,
            attempt_number: attempt.attempt_number,
            status: attempt.status.as_str().to_string(),
            response_status: attempt.response_status,
            response_body: attempt.response_body,
            error_message: attempt.error_message,
            request_headers: headers_to_json(&attempt.request_headers),
            request_body: attempt.request_body,
            response_headers: headers_to_json(&attempt.response_headers),
            attempted_at: attempt.attempted_at,
        };
        with_conn(&self.pool, move |conn| {
            let inserted: AttemptRow = diesel::insert_into(webhook_attempts::table)
                .values(&row)
                .returning(AttemptRow::as_returning())
                .get_result(conn)?;
            inserted.try_into()
        })
        .await
    }

    async fn attempts(&self, owner: i64) -> CoreResult<Vec<WebhookAttempt>> {
        use webhook_attempts::dsl;

        with_conn(&self.pool, move |conn| {
            dsl::webhook_attempts
                .filter(dsl::event_id.eq(owner))
                .order(dsl::attempt_number.asc())
                .select(AttemptRow::as_select())
                .load(conn)?
                .into_iter()
                .map(WebhookAttempt::try_from)
                .collect()
        })
        .await
    }

    async fn stalled_events(&self, updated_before: DateTime<Utc>) -> CoreResult<Vec<WebhookEvent>> {
        use webhook_events::dsl;

        with_conn(&self.pool, move |conn| {
            let rows = dsl::webhook_events
                .filter(dsl::status.eq(EventStatus::InProgress.as_str()))
                .filter(dsl::updated_at.lt(updated_before))
                .select(EventRow::as_select())
                .load(conn)?;
            into_events(rows)
        })
        .await
    }

    async fn delete_succeeded_before(&self, cutoff: DateTime<Utc>) -> CoreResult<usize> {
        use webhook_events::dsl;

        with_conn(&self.pool, move |conn| {
            Ok(diesel::delete(
                dsl::webhook_events
                    .filter(dsl::status.eq(EventStatus::Succeeded.as_str()))
                    .filter(dsl::updated_at.lt(cutoff)),
            )
            .execute(conn)?)
        })
        .await
    }

    async fn force_retry(&self, event_id: i64, now: DateTime<Utc>) -> CoreResult<WebhookEvent> {
        use webhook_events::dsl;

        with_conn(&self.pool, move |conn| {
            let row: EventRow = diesel::update(dsl::webhook_events.find(event_id))
                .set((
                    dsl::status.eq(EventStatus::Pending.as_str()),
                    dsl::next_attempt_at.eq(Some(now)),
                    dsl::updated_at.eq(now),
                ))
                .returning(EventRow::as_returning())
                .get_result(conn)
                .map_err(|e| match e {
                    diesel::result::Error::NotFound => {
                        CoreError::not_found(format!("Webhook event {event_id}"))
                    }
                    other => other.into(),
                })?;
            row.try_into()
        })
        .await
    }

    async fn delete_event(&self, event_id: i64) -> CoreResult<bool> {
        with_conn(&self.pool, move |conn| {
            let deleted = diesel::delete(webhook_events::table.find(event_id)).execute(conn)?;
            Ok(deleted > 0)
        })
        .await
    }
}
