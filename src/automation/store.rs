use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::core::error::{CoreError, CoreResult};
use crate::core::shared::schema::{automations, integration_modules};
use crate::core::shared::utils::{with_conn, DbPool};
use crate::filter::canonicalize;

/// A trigger-action binding: on `trigger_event`, if `condition` matches,
/// render `action_payload` and hand it to `action_module`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = automations)]
pub struct Automation {
    pub id: i64,
    pub name: String,
    pub trigger_event: String,
    pub enabled: bool,
    /// Canonical filter rule JSON.
    pub condition: Option<String>,
    pub action_module: String,
    pub action_payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Insertable, AsChangeset)]
#[diesel(table_name = automations)]
#[diesel(treat_none_as_null = true)]
pub struct NewAutomation {
    pub name: String,
    pub trigger_event: String,
    pub enabled: bool,
    pub condition: Option<String>,
    pub action_module: String,
    pub action_payload: Value,
}

impl NewAutomation {
    pub fn new(
        name: impl Into<String>,
        trigger_event: impl Into<String>,
        action_module: impl Into<String>,
        action_payload: Value,
    ) -> Self {
        Self {
            name: name.into(),
            trigger_event: trigger_event.into(),
            enabled: true,
            condition: None,
            action_module: action_module.into(),
            action_payload,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Trims names and stores the condition in canonical form.
    pub fn validated(mut self) -> CoreResult<Self> {
        self.name = self.name.trim().to_string();
        self.trigger_event = self.trigger_event.trim().to_string();
        self.action_module = self.action_module.trim().to_lowercase();
        if self.name.is_empty() {
            return Err(CoreError::validation("Automation name is required"));
        }
        if self.trigger_event.is_empty() {
            return Err(CoreError::validation("Trigger event is required"));
        }
        if self.action_module.is_empty() {
            return Err(CoreError::validation("Action module is required"));
        }
        self.condition = match self.condition.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(text) => Some(canonicalize(text)?),
        };
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = integration_modules)]
pub struct IntegrationModule {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub enabled: bool,
    /// Handler settings, e.g. `url`, `headers`, `defaults`.
    pub settings: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Insertable, AsChangeset)]
#[diesel(table_name = integration_modules)]
pub struct NewIntegrationModule {
    pub slug: String,
    pub name: String,
    pub enabled: bool,
    pub settings: Value,
}

#[async_trait]
pub trait AutomationStore: Send + Sync {
    /// Enabled automations for `event`, oldest first.
    async fn enabled_for_event(&self, event: &str) -> CoreResult<Vec<Automation>>;

    async fn create_automation(&self, automation: NewAutomation) -> CoreResult<Automation>;

    async fn update_automation(&self, id: i64, automation: NewAutomation) -> CoreResult<Automation>;

    async fn delete_automation(&self, id: i64) -> CoreResult<bool>;

    async fn module(&self, slug: &str) -> CoreResult<Option<IntegrationModule>>;

    /// Inserts or replaces by slug.
    async fn upsert_module(&self, module: NewIntegrationModule) -> CoreResult<IntegrationModule>;

    async fn list_modules(&self) -> CoreResult<Vec<IntegrationModule>>;
}

#[derive(Default)]
struct AutomationState {
    next_id: i64,
    automations: BTreeMap<i64, Automation>,
    modules: BTreeMap<String, IntegrationModule>,
}

impl AutomationState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryAutomationStore {
    state: Mutex<AutomationState>,
}

impl MemoryAutomationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, AutomationState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::internal("Automation store lock poisoned"))
    }
}

#[async_trait]
impl AutomationStore for MemoryAutomationStore {
    async fn enabled_for_event(&self, event: &str) -> CoreResult<Vec<Automation>> {
        Ok(self
            .lock()?
            .automations
            .values()
            .filter(|a| a.enabled && a.trigger_event == event)
            .cloned()
            .collect())
    }

    async fn create_automation(&self, automation: NewAutomation) -> CoreResult<Automation> {
        let automation = automation.validated()?;
        let mut state = self.lock()?;
        let now = Utc::now();
        let record = Automation {
            id: state.next_id(),
            name: automation.name,
            trigger_event: automation.trigger_event,
            enabled: automation.enabled,
            condition: automation.condition,
            action_module: automation.action_module,
            action_payload: automation.action_payload,
            created_at: now,
            updated_at: now,
        };
        state.automations.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_automation(&self, id: i64, automation: NewAutomation) -> CoreResult<Automation> {
        let automation = automation.validated()?;
        let mut state = self.lock()?;
        let record = state
            .automations
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("Automation {id}")))?;
        record.name = automation.name;
        record.trigger_event = automation.trigger_event;
        record.enabled = automation.enabled;
        record.condition = automation.condition;
        record.action_module = automation.action_module;
        record.action_payload = automation.action_payload;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn delete_automation(&self, id: i64) -> CoreResult<bool> {
        Ok(self.lock()?.automations.remove(&id).is_some())
    }

    async fn module(&self, slug: &str) -> CoreResult<Option<IntegrationModule>> {
        Ok(self.lock()?.modules.get(slug).cloned())
    }

    async fn upsert_module(&self, module: NewIntegrationModule) -> CoreResult<IntegrationModule> {
        let mut state = self.lock()?;
        let id = match state.modules.get(&module.slug) {
            Some(existing) => existing.id,
            None => state.next_id(),
        };
        let record = IntegrationModule {
            id,
            slug: module.slug,
            name: module.name,
            enabled: module.enabled,
            settings: module.settings,
        };
        state.modules.insert(record.slug.clone(), record.clone());
        Ok(record)
    }

    async fn list_modules(&self) -> CoreResult<Vec<IntegrationModule>> {
        Ok(self.lock()?.modules.values().cloned().collect())
    }
}

pub struct PgAutomationStore {
    pool: DbPool,
}

impl PgAutomationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AutomationStore for PgAutomationStore {
    async fn enabled_for_event(&self, event: &str) -> CoreResult<Vec<Automation>> {
        let event = event.to_string();
        with_conn(&self.pool, move |conn| {
            Ok(automations::table
                .filter(automations::enabled.eq(true))
                .filter(automations::trigger_event.eq(event))
                .order(automations::id.asc())
                .select(Automation::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn create_automation(&self, automation: NewAutomation) -> CoreResult<Automation> {
        let automation = automation.validated()?;
        with_conn(&self.pool, move |conn| {
            Ok(diesel::insert_into(automations::table)
                .values(&automation)
                .returning(Automation::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn update_automation(&self, id: i64, automation: NewAutomation) -> CoreResult<Automation> {
        let automation = automation.validated()?;
        with_conn(&self.pool, move |conn| {
            diesel::update(automations::table.find(id))
                .set((&automation, automations::updated_at.eq(Utc::now())))
                .returning(Automation::as_returning())
                .get_result(conn)
                .optional()?
                .ok_or_else(|| CoreError::not_found(format!("Automation {id}")))
        })
        .await
    }

    async fn delete_automation(&self, id: i64) -> CoreResult<bool> {
        with_conn(&self.pool, move |conn| {
            Ok(diesel::delete(automations::table.find(id)).execute(conn)? > 0)
        })
        .await
    }

    async fn module(&self, slug: &str) -> CoreResult<Option<IntegrationModule>> {
        let slug = slug.to_string();
        with_conn(&self.pool, move |conn| {
            Ok(integration_modules::table
                .filter(integration_modules::slug.eq(slug))
                .select(IntegrationModule::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn upsert_module(&self, module: NewIntegrationModule) -> CoreResult<IntegrationModule> {
        with_conn(&self.pool, move |conn| {
            Ok(diesel::insert_into(integration_modules::table)
                .values(&module)
                .on_conflict(integration_modules::slug)
                .do_update()
                .set(&module)
                .returning(IntegrationModule::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn list_modules(&self) -> CoreResult<Vec<IntegrationModule>> {
        with_conn(&self.pool, move |conn| {
            Ok(integration_modules::table
                .order(integration_modules::slug.asc())
                .select(IntegrationModule::as_select())
                .load(conn)?)
        })
        .await
    }
}
