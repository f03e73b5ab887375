//! Trigger-action bindings: domain events in, rendered webhook payloads out.
//!
//! An automation names a trigger event, an optional filter condition, an
//! integration module and a payload template. The router renders the payload
//! against the event context and hands it to the module's handler.

pub mod modules;
pub mod router;
pub mod store;

pub use modules::{
    merge_defaults, ActionContext, ActionHandler, ModuleRegistry, WebhookActionHandler,
    WEBHOOK_MODULE,
};
pub use router::{AutomationRouter, RouteOutcome};
pub use store::{
    Automation, AutomationStore, IntegrationModule, MemoryAutomationStore, NewAutomation,
    NewIntegrationModule, PgAutomationStore,
};
