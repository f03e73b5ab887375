use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::core::error::CoreError;

pub type Headers = BTreeMap<String, String>;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
pub const DEFAULT_BACKOFF_SECONDS: i32 = 60;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(CoreError::Internal(format!(
                        concat!("Unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

string_enum!(EventStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Succeeded => "succeeded",
    Failed => "failed",
});

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

string_enum!(Direction {
    Outgoing => "outgoing",
    Incoming => "incoming",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Succeeded,
    Failed,
    Error,
    Timeout,
}

string_enum!(AttemptStatus {
    Succeeded => "succeeded",
    Failed => "failed",
    Error => "error",
    Timeout => "timeout",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: i64,
    pub name: String,
    pub direction: Direction,
    pub target_url: Option<String>,
    pub source_url: Option<String>,
    pub headers: Headers,
    pub payload: Value,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub backoff_seconds: i32,
    pub status: EventStatus,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewWebhookEvent {
    pub name: String,
    pub direction: Direction,
    pub target_url: Option<String>,
    pub source_url: Option<String>,
    pub headers: Headers,
    pub payload: Value,
    pub max_attempts: i32,
    pub backoff_seconds: i32,
    pub status: EventStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookAttempt {
    pub id: i64,
    pub event_id: i64,
    pub attempt_number: i32,
    pub status: AttemptStatus,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub request_headers: Headers,
    pub request_body: Option<String>,
    pub response_headers: Headers,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAttempt {
    pub event_id: i64,
    pub attempt_number: i32,
    pub status: AttemptStatus,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub request_headers: Headers,
    pub request_body: Option<String>,
    pub response_headers: Headers,
    pub attempted_at: DateTime<Utc>,
}

/// Final field values written when an in-progress event is released.
#[derive(Debug, Clone, PartialEq)]
pub struct EventOutcome {
    pub status: EventStatus,
    pub attempt_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventQuery {
    pub status: Option<EventStatus>,
    pub direction: Option<Direction>,
    pub name: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl EventQuery {
    pub const DEFAULT_LIMIT: i64 = 100;

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, 1000)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    pub fn accepts(&self, event: &WebhookEvent) -> bool {
        self.status.map_or(true, |s| s == event.status)
            && self.direction.map_or(true, |d| d == event.direction)
            && self.name.as_ref().map_or(true, |n| n == &event.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub name: String,
    pub target_url: String,
    pub payload: Value,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: i32,
    #[serde(default)]
    pub attempt_immediately: bool,
}

fn default_max_attempts() -> i32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_seconds() -> i32 {
    DEFAULT_BACKOFF_SECONDS
}

impl EnqueueRequest {
    pub fn new(name: impl Into<String>, target_url: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            target_url: target_url.into(),
            payload,
            headers: Headers::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_seconds: DEFAULT_BACKOFF_SECONDS,
            attempt_immediately: false,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn retries(mut self, max_attempts: i32, backoff_seconds: i32) -> Self {
        self.max_attempts = max_attempts;
        self.backoff_seconds = backoff_seconds;
        self
    }

    pub fn immediately(mut self) -> Self {
        self.attempt_immediately = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualOutcome {
    pub success: bool,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            EventStatus::Pending,
            EventStatus::InProgress,
            EventStatus::Succeeded,
            EventStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<EventStatus>().unwrap(), status);
        }
        assert!("queued".parse::<EventStatus>().is_err());
        assert_eq!(
            serde_json::to_value(EventStatus::InProgress).unwrap(),
            json!("in_progress")
        );
    }

    #[test]
    fn test_enqueue_request_defaults_from_json() {
        let req: EnqueueRequest = serde_json::from_value(json!({
            "name": "tickets.created",
            "target_url": "https://hooks.example/t",
            "payload": {"id": 1}
        }))
        .unwrap();
        assert_eq!(req.max_attempts, 3);
        assert_eq!(req.backoff_seconds, 60);
        assert!(!req.attempt_immediately);
    }
}
