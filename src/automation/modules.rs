use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::error::{CoreError, CoreResult};
use crate::webhooks::{EnqueueRequest, Headers, WebhookDispatcher};

pub const WEBHOOK_MODULE: &str = "webhook";

const DEFAULT_MAX_ATTEMPTS: i32 = 3;
const DEFAULT_BACKOFF_SECONDS: i32 = 60;

/// What fired the action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionContext {
    pub event: String,
    pub automation_id: i64,
    pub module: String,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, action: &ActionContext, settings: &Value, payload: Value) -> CoreResult<Value>;
}

/// Enqueues the payload as an outgoing webhook to the module's `url`.
pub struct WebhookActionHandler {
    dispatcher: Arc<WebhookDispatcher>,
}

impl WebhookActionHandler {
    pub fn new(dispatcher: Arc<WebhookDispatcher>) -> Self {
        Self { dispatcher }
    }
}

fn int_setting(settings: &Value, key: &str, default: i32) -> CoreResult<i32> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| CoreError::validation(format!("Module setting '{key}' must be an integer"))),
    }
}

fn header_settings(settings: &Value) -> CoreResult<Headers> {
    let mut headers = Headers::new();
    match settings.get("headers") {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (name, value) in map {
                let value = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(_) | Value::Bool(_) => value.to_string(),
                    _ => {
                        return Err(CoreError::validation(format!(
                            "Header '{name}' must be a scalar"
                        )))
                    }
                };
                headers.insert(name.clone(), value);
            }
        }
        Some(_) => return Err(CoreError::validation("Module 'headers' must be an object")),
    }
    Ok(headers)
}

#[async_trait]
impl ActionHandler for WebhookActionHandler {
    async fn handle(&self, action: &ActionContext, settings: &Value, payload: Value) -> CoreResult<Value> {
        let url = settings
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CoreError::validation(format!("Module '{}' has no url", action.module)))?;

        let mut request = EnqueueRequest::new(action.event.clone(), url, payload).retries(
            int_setting(settings, "max_attempts", DEFAULT_MAX_ATTEMPTS)?,
            int_setting(settings, "backoff_seconds", DEFAULT_BACKOFF_SECONDS)?,
        );
        request.headers = header_settings(settings)?;

        let event = self.dispatcher.enqueue(request).await?;
        debug!(
            "Automation {} queued webhook event {} for {}",
            action.automation_id, event.id, action.event
        );
        Ok(json!({ "webhook_event_id": event.id }))
    }
}

/// Module slug to handler; slugs without a dedicated handler use the generic one.
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    generic: Option<Arc<dyn ActionHandler>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the `webhook` handler as the generic fallback.
    pub fn with_webhooks(dispatcher: Arc<WebhookDispatcher>) -> Self {
        let handler: Arc<dyn ActionHandler> = Arc::new(WebhookActionHandler::new(dispatcher));
        let mut registry = Self::new();
        registry.register(WEBHOOK_MODULE, Arc::clone(&handler));
        registry.generic = Some(handler);
        registry
    }

    pub fn register(&mut self, slug: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(slug.into(), handler);
    }

    pub fn handler_for(&self, slug: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(slug).or(self.generic.as_ref()).cloned()
    }
}

/// Adds `defaults` entries the payload lacks; nested objects merge the same way.
pub fn merge_defaults(payload: Value, defaults: &Value) -> Value {
    match (payload, defaults) {
        (Value::Object(mut map), Value::Object(defaults)) => {
            for (key, default) in defaults {
                match map.get_mut(key) {
                    Some(existing) => {
                        let current = existing.take();
                        *existing = merge_defaults(current, default);
                    }
                    None => {
                        map.insert(key.clone(), default.clone());
                    }
                }
            }
            Value::Object(map)
        }
        (Value::Null, Value::Object(defaults)) => Value::Object(defaults.clone()),
        (payload, _) => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::WebhookSettings;
    use crate::webhooks::{EventQuery, MemoryWebhookStore, WebhookStore};

    #[test]
    fn test_defaults_only_fill_absent_keys() {
        let merged = merge_defaults(
            json!({ "title": "", "meta": { "source": "email" } }),
            &json!({ "title": "Untitled", "priority": "normal", "meta": { "source": "x", "v": 1 } }),
        );
        assert_eq!(
            merged,
            json!({ "title": "", "meta": { "source": "email", "v": 1 }, "priority": "normal" })
        );
        assert_eq!(merge_defaults(json!("text"), &json!({ "a": 1 })), json!("text"));
    }

    #[test]
    fn test_empty_registry_has_no_handler() {
        let registry = ModuleRegistry::new();
        assert!(registry.handler_for("slack").is_none());
    }

    #[tokio::test]
    async fn test_webhook_handler_enqueues_with_settings() {
        let store = Arc::new(MemoryWebhookStore::new());
        let dispatcher =
            Arc::new(WebhookDispatcher::new(store.clone(), WebhookSettings::default()).unwrap());
        let registry = ModuleRegistry::with_webhooks(dispatcher);
        let handler = registry.handler_for("crm-sync").unwrap();
        let action = ActionContext {
            event: "tickets.created".to_string(),
            automation_id: 1,
            module: "crm-sync".to_string(),
        };
        let settings = json!({
            "url": "https://crm.example/hooks",
            "headers": { "X-Token": "abc", "X-Version": 2 },
            "max_attempts": "5"
        });

        let out = handler.handle(&action, &settings, json!({ "id": 7 })).await.unwrap();
        let event_id = out["webhook_event_id"].as_i64().unwrap();
        let events = store.list_events(&EventQuery::default()).await.unwrap();
        let event = events.iter().find(|e| e.id == event_id).unwrap();
        assert_eq!(event.name, "tickets.created");
        assert_eq!(event.target_url.as_deref(), Some("https://crm.example/hooks"));
        assert_eq!(event.max_attempts, 5);
        assert_eq!(event.backoff_seconds, 60);
        assert_eq!(event.headers.get("X-Version").map(String::as_str), Some("2"));
        assert_eq!(event.payload, json!({ "id": 7 }));

        let missing = handler.handle(&action, &json!({}), json!({})).await;
        assert!(matches!(missing, Err(CoreError::Validation(_))));
    }
}
