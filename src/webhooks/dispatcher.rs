use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, trace, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::redact::{redact_request_headers, redact_response_headers, truncate_body};
use super::store::WebhookStore;
use super::types::{
    AttemptStatus, Direction, EnqueueRequest, EventOutcome, EventQuery, EventStatus, Headers,
    ManualOutcome, NewAttempt, NewWebhookEvent, WebhookAttempt, WebhookEvent,
};
use crate::core::config::WebhookSettings;
use crate::core::error::{CoreError, CoreResult};

const CANCELLED_MESSAGE: &str = "Delivery cancelled: dispatcher shutting down";

/// `backoff × 2^(attempt-1)`, capped.
pub fn backoff_delay(backoff_seconds: i32, attempt_number: i32, max_backoff_secs: i64) -> Duration {
    let exponent = attempt_number.saturating_sub(1).clamp(0, 30) as u32;
    let secs = i64::from(backoff_seconds.max(0)).saturating_mul(1i64 << exponent);
    Duration::seconds(secs.min(max_backoff_secs))
}

struct Delivery {
    status: AttemptStatus,
    response_status: Option<i32>,
    response_body: Option<String>,
    response_headers: Headers,
    error: Option<String>,
}

impl Delivery {
    fn failed(status: AttemptStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            response_status: None,
            response_body: None,
            response_headers: Headers::new(),
            error: Some(error.into()),
        }
    }
}

/// Drains due outgoing events with a pool of workers and records every try.
pub struct WebhookDispatcher {
    store: Arc<dyn WebhookStore>,
    client: reqwest::Client,
    settings: WebhookSettings,
    in_flight: Mutex<HashSet<i64>>,
    shutdown: CancellationToken,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn WebhookStore>, settings: WebhookSettings) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| CoreError::internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            store,
            client,
            settings,
            in_flight: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn store(&self) -> &Arc<dyn WebhookStore> {
        &self.store
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> CoreResult<WebhookEvent> {
        validate_target(&request.target_url)?;
        if request.max_attempts < 1 {
            return Err(CoreError::validation("max_attempts must be at least 1"));
        }
        if request.backoff_seconds < 0 {
            return Err(CoreError::validation("backoff_seconds must not be negative"));
        }

        let event = self
            .store
            .insert_event(NewWebhookEvent {
                name: request.name,
                direction: Direction::Outgoing,
                target_url: Some(request.target_url),
                source_url: None,
                headers: request.headers,
                payload: request.payload,
                max_attempts: request.max_attempts,
                backoff_seconds: request.backoff_seconds,
                status: EventStatus::Pending,
            })
            .await?;
        debug!("Enqueued webhook event {} ({})", event.id, event.name);

        if request.attempt_immediately {
            if let Some(attempted) = self.attempt(event.id).await? {
                return Ok(attempted);
            }
        }
        Ok(event)
    }

    /// Inserts an event already `in_progress`; the caller performs the call
    /// and reports back through [`record_manual_outcome`](Self::record_manual_outcome).
    pub async fn create_manual_event(
        &self,
        name: &str,
        target_url: &str,
        payload: Value,
        headers: Headers,
    ) -> CoreResult<WebhookEvent> {
        validate_target(target_url)?;
        self.store
            .insert_event(NewWebhookEvent {
                name: name.to_string(),
                direction: Direction::Outgoing,
                target_url: Some(target_url.to_string()),
                source_url: None,
                headers,
                payload,
                max_attempts: 1,
                backoff_seconds: 0,
                status: EventStatus::InProgress,
            })
            .await
    }

    pub async fn record_manual_outcome(
        &self,
        event_id: i64,
        outcome: ManualOutcome,
    ) -> CoreResult<WebhookEvent> {
        let event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("Webhook event {event_id}")))?;
        if event.status != EventStatus::InProgress {
            return Err(CoreError::validation(format!(
                "Webhook event {event_id} is {}, not in_progress",
                event.status
            )));
        }

        let now = Utc::now();
        let attempt_number = event.attempt_count + 1;
        let status = if outcome.success {
            AttemptStatus::Succeeded
        } else if outcome.response_status.is_some() {
            AttemptStatus::Failed
        } else {
            AttemptStatus::Error
        };
        let response_body = outcome.response_body.as_deref().map(truncate_body);
        let error = if outcome.success {
            None
        } else {
            Some(outcome.error.clone().unwrap_or_else(|| match outcome.response_status {
                Some(code) => format!("Unexpected status {code}"),
                None => "Request failed".to_string(),
            }))
        };

        self.store
            .record_attempt(NewAttempt {
                event_id,
                attempt_number,
                status,
                response_status: outcome.response_status,
                response_body: response_body.clone(),
                error_message: error.clone(),
                request_headers: redact_request_headers(&event.headers),
                request_body: Some(truncate_body(&event.payload.to_string())),
                response_headers: Headers::new(),
                attempted_at: now,
            })
            .await?;

        let final_status = if outcome.success {
            EventStatus::Succeeded
        } else {
            EventStatus::Failed
        };
        self.store
            .complete(
                event_id,
                &EventOutcome {
                    status: final_status,
                    attempt_count: attempt_number,
                    next_attempt_at: None,
                    last_error: error,
                    response_status: outcome.response_status,
                    response_body,
                },
                now,
            )
            .await?
            .ok_or_else(|| {
                CoreError::validation(format!("Webhook event {event_id} changed state concurrently"))
            })
    }

    /// Audit record of a webhook received from elsewhere; never polled.
    pub async fn record_incoming(
        &self,
        name: &str,
        source_url: Option<&str>,
        headers: Headers,
        payload: Value,
    ) -> CoreResult<WebhookEvent> {
        self.store
            .insert_event(NewWebhookEvent {
                name: name.to_string(),
                direction: Direction::Incoming,
                target_url: None,
                source_url: source_url.map(str::to_string),
                headers: redact_request_headers(&headers),
                payload,
                max_attempts: 1,
                backoff_seconds: 0,
                status: EventStatus::Succeeded,
            })
            .await
    }

    pub async fn get_event(&self, event_id: i64) -> CoreResult<Option<WebhookEvent>> {
        self.store.get_event(event_id).await
    }

    pub async fn list_events(&self, query: &EventQuery) -> CoreResult<Vec<WebhookEvent>> {
        self.store.list_events(query).await
    }

    pub async fn attempts(&self, event_id: i64) -> CoreResult<Vec<WebhookAttempt>> {
        self.store.attempts(event_id).await
    }

    pub async fn delete_event(&self, event_id: i64) -> CoreResult<bool> {
        self.store.delete_event(event_id).await
    }

    pub async fn force_retry(&self, event_id: i64) -> CoreResult<WebhookEvent> {
        let event = self.store.force_retry(event_id, Utc::now()).await?;
        info!("Webhook event {} reset to pending by operator", event_id);
        Ok(event)
    }

    /// Claims and attempts one event now, ignoring `next_attempt_at`.
    /// Returns `None` when the event was not pending.
    pub async fn attempt(&self, event_id: i64) -> CoreResult<Option<WebhookEvent>> {
        let Some(event) = self.store.claim(event_id, Utc::now()).await? else {
            trace!("Webhook event {} not claimable", event_id);
            return Ok(None);
        };
        self.deliver(event).await.map(Some)
    }

    /// One producer pass processed inline. Returns the number of events attempted.
    pub async fn poll_once(&self) -> CoreResult<usize> {
        let due = self
            .store
            .due_events(Utc::now(), self.settings.batch_size)
            .await?;
        let mut attempted = 0;
        for event_id in due {
            match self.attempt(event_id).await {
                Ok(Some(_)) => attempted += 1,
                Ok(None) => {}
                Err(e) => error!("Webhook event {} attempt failed: {}", event_id, e),
            }
        }
        Ok(attempted)
    }

    async fn deliver(&self, event: WebhookEvent) -> CoreResult<WebhookEvent> {
        let started = Utc::now();
        let attempt_number = event.attempt_count + 1;
        let headers = request_headers(&event.headers);
        let body = event.payload.to_string();

        let delivery = match event.target_url.as_deref() {
            None => Delivery::failed(AttemptStatus::Error, "Event has no target_url"),
            Some(url) => {
                tokio::select! {
                    delivery = self.send(url, &headers, body.clone()) => delivery,
                    _ = self.shutdown.cancelled() => {
                        Delivery::failed(AttemptStatus::Error, CANCELLED_MESSAGE)
                    }
                }
            }
        };

        let finished = Utc::now();
        self.store
            .record_attempt(NewAttempt {
                event_id: event.id,
                attempt_number,
                status: delivery.status,
                response_status: delivery.response_status,
                response_body: delivery.response_body.clone(),
                error_message: delivery.error.clone(),
                request_headers: redact_request_headers(&headers),
                request_body: Some(truncate_body(&body)),
                response_headers: redact_response_headers(&delivery.response_headers),
                attempted_at: started,
            })
            .await?;

        let outcome = self.outcome_for(&event, attempt_number, &delivery, finished);
        match outcome.status {
            EventStatus::Succeeded => debug!("Webhook event {} delivered", event.id),
            EventStatus::Pending => warn!(
                "Webhook event {} attempt {}/{} failed, retry at {:?}: {}",
                event.id,
                attempt_number,
                event.max_attempts,
                outcome.next_attempt_at,
                outcome.last_error.as_deref().unwrap_or_default()
            ),
            _ => error!(
                "Webhook event {} failed permanently after {} attempt(s): {}",
                event.id,
                attempt_number,
                outcome.last_error.as_deref().unwrap_or_default()
            ),
        }

        self.store
            .complete(event.id, &outcome, finished)
            .await?
            .ok_or_else(|| {
                CoreError::Internal(format!(
                    "Webhook event {} left in_progress by another writer",
                    event.id
                ))
            })
    }

    fn outcome_for(
        &self,
        event: &WebhookEvent,
        attempt_number: i32,
        delivery: &Delivery,
        now: DateTime<Utc>,
    ) -> EventOutcome {
        if delivery.status == AttemptStatus::Succeeded {
            return EventOutcome {
                status: EventStatus::Succeeded,
                attempt_count: attempt_number,
                next_attempt_at: None,
                last_error: None,
                response_status: delivery.response_status,
                response_body: delivery.response_body.clone(),
            };
        }

        let fail_fast = self.settings.fail_fast_on_client_error
            && delivery.response_status.is_some_and(is_permanent_client_error);
        let exhausted = attempt_number >= event.max_attempts;
        let (status, next_attempt_at) = if exhausted || fail_fast {
            (EventStatus::Failed, None)
        } else {
            let delay = backoff_delay(
                event.backoff_seconds,
                attempt_number,
                self.settings.max_backoff_secs,
            );
            (EventStatus::Pending, Some(now + delay))
        };
        EventOutcome {
            status,
            attempt_count: attempt_number,
            next_attempt_at,
            last_error: delivery.error.clone(),
            response_status: delivery.response_status,
            response_body: delivery.response_body.clone(),
        }
    }

    async fn send(&self, url: &str, headers: &Headers, body: String) -> Delivery {
        let header_map = match to_header_map(headers) {
            Ok(map) => map,
            Err(e) => return Delivery::failed(AttemptStatus::Error, e),
        };

        let response = match self
            .client
            .post(url)
            .headers(header_map)
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Delivery::failed(
                    AttemptStatus::Timeout,
                    format!(
                        "Request timed out after {}s",
                        self.settings.request_timeout_secs
                    ),
                )
            }
            Err(e) => return Delivery::failed(AttemptStatus::Error, e.to_string()),
        };

        let code = response.status().as_u16();
        let response_headers: Headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                warn!("Could not read response body from {}: {}", url, e);
                String::new()
            }
        };

        let success = (200..300).contains(&code);
        Delivery {
            status: if success {
                AttemptStatus::Succeeded
            } else {
                AttemptStatus::Failed
            },
            response_status: Some(i32::from(code)),
            response_body: Some(truncate_body(&text)),
            response_headers,
            error: (!success).then(|| format!("Unexpected status {code}")),
        }
    }

    /// Records a `timeout` attempt for events stuck `in_progress` and fails them.
    pub async fn sweep_timeouts(&self) -> CoreResult<usize> {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(self.settings.stall_timeout_secs);
        let stalled = self.store.stalled_events(cutoff).await?;
        let mut swept = 0;
        for event in stalled {
            let message = format!(
                "Timed out after {}s in progress",
                self.settings.stall_timeout_secs
            );
            let attempt_number = event.attempt_count + 1;
            if let Err(e) = self
                .store
                .record_attempt(NewAttempt {
                    event_id: event.id,
                    attempt_number,
                    status: AttemptStatus::Timeout,
                    response_status: None,
                    response_body: None,
                    error_message: Some(message.clone()),
                    request_headers: redact_request_headers(&event.headers),
                    request_body: None,
                    response_headers: Headers::new(),
                    attempted_at: now,
                })
                .await
            {
                warn!("Could not record timeout for webhook event {}: {}", event.id, e);
                continue;
            }
            let outcome = EventOutcome {
                status: EventStatus::Failed,
                attempt_count: attempt_number,
                next_attempt_at: None,
                last_error: Some(message),
                response_status: event.response_status,
                response_body: event.response_body.clone(),
            };
            if self.store.complete(event.id, &outcome, now).await?.is_some() {
                warn!("Webhook event {} timed out in progress", event.id);
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Deletes succeeded events older than the retention window.
    pub async fn purge_succeeded(&self) -> CoreResult<usize> {
        let cutoff = Utc::now() - Duration::hours(self.settings.retention_hours);
        let deleted = self.store.delete_succeeded_before(cutoff).await?;
        if deleted > 0 {
            info!("Purged {} succeeded webhook event(s)", deleted);
        }
        Ok(deleted)
    }

    /// Producer + worker pool until the shutdown token fires.
    pub async fn run(self: Arc<Self>) {
        let workers = self.settings.workers.max(1);
        let capacity = usize::try_from(self.settings.batch_size.max(1)).unwrap_or(1);
        let (tx, rx) = mpsc::channel::<i64>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        info!("Webhook dispatcher started with {} worker(s)", workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let dispatcher = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(async move {
                dispatcher.work(worker, rx).await;
            }));
        }

        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.settings.poll_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let due = match self
                .store
                .due_events(Utc::now(), self.settings.batch_size)
                .await
            {
                Ok(due) => due,
                Err(e) => {
                    error!("Failed to load due webhook events: {}", e);
                    continue;
                }
            };
            trace!("{} webhook event(s) due", due.len());
            for event_id in due {
                if !self.mark_in_flight(event_id) {
                    continue;
                }
                if tx.send(event_id).await.is_err() {
                    break;
                }
            }
        }

        drop(tx);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Webhook worker panicked: {}", e);
            }
        }
        info!("Webhook dispatcher stopped");
    }

    async fn work(&self, worker: usize, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<i64>>>) {
        loop {
            let next = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    id = rx.recv() => id,
                    _ = self.shutdown.cancelled() => None,
                }
            };
            let Some(event_id) = next else {
                trace!("Webhook worker {} exiting", worker);
                return;
            };
            match self.attempt(event_id).await {
                Ok(Some(event)) => trace!(
                    "Worker {} finished event {} as {}",
                    worker,
                    event_id,
                    event.status
                ),
                Ok(None) => {}
                Err(e) => error!("Webhook event {} attempt failed: {}", event_id, e),
            }
            self.clear_in_flight(event_id);
        }
    }

    fn mark_in_flight(&self, event_id: i64) -> bool {
        match self.in_flight.lock() {
            Ok(mut set) => set.insert(event_id),
            Err(_) => false,
        }
    }

    fn clear_in_flight(&self, event_id: i64) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&event_id);
        }
    }
}

fn is_permanent_client_error(code: i32) -> bool {
    (400..500).contains(&code) && code != 408 && code != 429
}

fn validate_target(url: &str) -> CoreResult<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| CoreError::validation(format!("Invalid target_url '{url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(CoreError::validation(format!(
            "Unsupported target_url scheme '{other}'"
        ))),
    }
}

/// Event headers plus `Content-Type: application/json` unless overridden.
fn request_headers(headers: &Headers) -> Headers {
    let mut out = headers.clone();
    if !out.keys().any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str())) {
        out.insert("Content-Type".to_string(), "application/json".to_string());
    }
    out
}

fn to_header_map(headers: &Headers) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| format!("Invalid header name '{key}': {e}"))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| format!("Invalid value for header '{key}': {e}"))?;
        map.insert(name, value);
    }
    Ok(map)
}
