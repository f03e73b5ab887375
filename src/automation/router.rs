use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use super::modules::{merge_defaults, ActionContext, ModuleRegistry};
use super::store::{Automation, AutomationStore};
use crate::core::error::CoreResult;
use crate::filter::FilterRule;
use crate::template::TemplateEngine;
use crate::tickets::DomainEventSink;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RouteOutcome {
    Dispatched { automation_id: i64, result: Value },
    ConditionFailed { automation_id: i64 },
    Skipped { automation_id: i64, reason: String },
    Failed { automation_id: i64, error: String },
}

/// Fans domain events out to the automations bound to them.
pub struct AutomationRouter {
    store: Arc<dyn AutomationStore>,
    engine: TemplateEngine,
    modules: ModuleRegistry,
}

impl AutomationRouter {
    pub fn new(store: Arc<dyn AutomationStore>, engine: TemplateEngine, modules: ModuleRegistry) -> Self {
        Self {
            store,
            engine,
            modules,
        }
    }

    /// Runs every enabled automation for `event`; one failing automation does not stop the rest.
    pub async fn route(&self, event: &str, context: &Value) -> CoreResult<Vec<RouteOutcome>> {
        let automations = self.store.enabled_for_event(event).await?;
        debug!("{} automation(s) bound to {}", automations.len(), event);

        let mut outcomes = Vec::with_capacity(automations.len());
        for automation in automations {
            let outcome = self.run(event, &automation, context).await;
            match &outcome {
                RouteOutcome::Dispatched { .. } => {
                    info!("Automation {} ({}) fired for {}", automation.id, automation.name, event)
                }
                RouteOutcome::Skipped { reason, .. } => {
                    warn!("Automation {} skipped: {}", automation.id, reason)
                }
                RouteOutcome::Failed { error, .. } => {
                    warn!("Automation {} failed: {}", automation.id, error)
                }
                RouteOutcome::ConditionFailed { .. } => {}
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn run(&self, event: &str, automation: &Automation, context: &Value) -> RouteOutcome {
        let automation_id = automation.id;
        if let Some(condition) = automation.condition.as_deref() {
            match FilterRule::parse(condition) {
                Ok(rule) if !rule.matches(context) => {
                    return RouteOutcome::ConditionFailed { automation_id }
                }
                Ok(_) => {}
                Err(e) => {
                    return RouteOutcome::Skipped {
                        automation_id,
                        reason: format!("invalid condition: {e}"),
                    }
                }
            }
        }

        let module = match self.store.module(&automation.action_module).await {
            Ok(Some(module)) if module.enabled => module,
            Ok(Some(_)) => {
                return RouteOutcome::Skipped {
                    automation_id,
                    reason: format!("module '{}' is disabled", automation.action_module),
                }
            }
            Ok(None) => {
                return RouteOutcome::Skipped {
                    automation_id,
                    reason: format!("module '{}' is not configured", automation.action_module),
                }
            }
            Err(e) => {
                return RouteOutcome::Failed {
                    automation_id,
                    error: e.to_string(),
                }
            }
        };
        let Some(handler) = self.modules.handler_for(&module.slug) else {
            return RouteOutcome::Skipped {
                automation_id,
                reason: format!("no handler for module '{}'", module.slug),
            };
        };

        let rendered = self.engine.render(&automation.action_payload, context).await;
        let payload = match module.settings.get("defaults") {
            Some(defaults) => merge_defaults(rendered, defaults),
            None => rendered,
        };

        let action = ActionContext {
            event: event.to_string(),
            automation_id,
            module: module.slug.clone(),
        };
        match handler.handle(&action, &module.settings, payload).await {
            Ok(result) => RouteOutcome::Dispatched {
                automation_id,
                result,
            },
            Err(e) => RouteOutcome::Failed {
                automation_id,
                error: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl DomainEventSink for AutomationRouter {
    async fn emit(&self, name: &str, context: Value) -> CoreResult<()> {
        self.route(name, &context).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::store::{MemoryAutomationStore, NewAutomation, NewIntegrationModule};
    use crate::core::config::WebhookSettings;
    use crate::webhooks::{EventQuery, MemoryWebhookStore, WebhookDispatcher, WebhookStore};
    use serde_json::json;

    struct Fixture {
        router: AutomationRouter,
        automations: Arc<MemoryAutomationStore>,
        webhooks: Arc<MemoryWebhookStore>,
    }

    async fn fixture(settings: Value) -> Fixture {
        let automations = Arc::new(MemoryAutomationStore::new());
        automations
            .upsert_module(NewIntegrationModule {
                slug: "webhook".to_string(),
                name: "Webhook".to_string(),
                enabled: true,
                settings,
            })
            .await
            .unwrap();
        let webhooks = Arc::new(MemoryWebhookStore::new());
        let dispatcher =
            Arc::new(WebhookDispatcher::new(webhooks.clone(), WebhookSettings::default()).unwrap());
        let router = AutomationRouter::new(
            automations.clone(),
            TemplateEngine::new(),
            ModuleRegistry::with_webhooks(dispatcher),
        );
        Fixture {
            router,
            automations,
            webhooks,
        }
    }

    fn context() -> Value {
        json!({
            "ticket": {
                "id": 12,
                "number": "TKT-7",
                "subject": "Printer down",
                "priority": "high",
                "labels": [],
                "requester": { "email": "alice@acme.example" }
            },
            "actor": null
        })
    }

    #[tokio::test]
    async fn test_matching_automation_enqueues_rendered_payload() {
        let f = fixture(json!({
            "url": "https://hooks.example/desk",
            "defaults": { "channel": "#support", "title": "Untitled" }
        }))
        .await;
        f.automations
            .create_automation(
                NewAutomation::new(
                    "Notify",
                    "tickets.created",
                    "webhook",
                    json!({ "title": "{{ticket.number}}: {{ticket.subject}}", "from": "{{ticket.requester.email}}" }),
                )
                .with_condition(r#"{"field":"ticket.priority","equals":"high"}"#),
            )
            .await
            .unwrap();

        let outcomes = f.router.route("tickets.created", &context()).await.unwrap();
        assert!(matches!(outcomes.as_slice(), [RouteOutcome::Dispatched { .. }]));

        let events = f.webhooks.list_events(&EventQuery::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "tickets.created");
        assert_eq!(events[0].max_attempts, 3);
        assert_eq!(
            events[0].payload,
            json!({
                "title": "TKT-7: Printer down",
                "from": "alice@acme.example",
                "channel": "#support"
            })
        );
    }

    #[tokio::test]
    async fn test_condition_and_event_filtering() {
        let f = fixture(json!({ "url": "https://hooks.example/desk" })).await;
        f.automations
            .create_automation(
                NewAutomation::new("Low only", "tickets.created", "webhook", json!({}))
                    .with_condition(r#"{"field":"ticket.priority","equals":"low"}"#),
            )
            .await
            .unwrap();
        f.automations
            .create_automation(NewAutomation::new("Updates", "tickets.updated", "webhook", json!({})))
            .await
            .unwrap();

        let outcomes = f.router.route("tickets.created", &context()).await.unwrap();
        assert!(matches!(outcomes.as_slice(), [RouteOutcome::ConditionFailed { .. }]));
        assert!(f.webhooks.list_events(&EventQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_module_is_skipped_but_others_run() {
        let f = fixture(json!({ "url": "https://hooks.example/desk" })).await;
        f.automations
            .create_automation(NewAutomation::new("Slack", "tickets.created", "slack", json!({})))
            .await
            .unwrap();
        f.automations
            .create_automation(NewAutomation::new("Hook", "tickets.created", "webhook", json!({ "n": "{{ticket.number}}" })))
            .await
            .unwrap();

        f.router.emit("tickets.created", context()).await.unwrap();
        let events = f.webhooks.list_events(&EventQuery::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, json!({ "n": "TKT-7" }));
    }
}
