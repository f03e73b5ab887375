use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::core::error::{CoreError, CoreResult};
use crate::core::shared::schema::scheduled_tasks;
use crate::core::shared::utils::{with_conn, DbPool};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = scheduled_tasks)]
pub struct ScheduledTask {
    pub id: i64,
    pub name: String,
    pub task_type: String,
    pub cron_expression: String,
    pub payload: Value,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable, AsChangeset)]
#[diesel(table_name = scheduled_tasks)]
pub struct NewScheduledTask {
    pub name: String,
    pub task_type: String,
    pub cron_expression: String,
    pub payload: Value,
    pub enabled: bool,
}

#[async_trait]
pub trait ScheduledTaskStore: Send + Sync {
    async fn create(&self, task: NewScheduledTask) -> CoreResult<ScheduledTask>;

    async fn update(&self, id: i64, task: NewScheduledTask) -> CoreResult<ScheduledTask>;

    async fn delete(&self, id: i64) -> CoreResult<bool>;

    async fn get(&self, id: i64) -> CoreResult<Option<ScheduledTask>>;

    async fn list_enabled(&self) -> CoreResult<Vec<ScheduledTask>>;

    async fn mark_run(&self, id: i64, at: DateTime<Utc>) -> CoreResult<()>;
}

#[derive(Default)]
pub struct MemoryScheduledTaskStore {
    tasks: Mutex<(i64, BTreeMap<i64, ScheduledTask>)>,
}

impl MemoryScheduledTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, (i64, BTreeMap<i64, ScheduledTask>)>> {
        self.tasks
            .lock()
            .map_err(|_| CoreError::internal("Scheduled task store lock poisoned"))
    }
}

#[async_trait]
impl ScheduledTaskStore for MemoryScheduledTaskStore {
    async fn create(&self, task: NewScheduledTask) -> CoreResult<ScheduledTask> {
        let mut guard = self.lock()?;
        guard.0 += 1;
        let now = Utc::now();
        let record = ScheduledTask {
            id: guard.0,
            name: task.name,
            task_type: task.task_type,
            cron_expression: task.cron_expression,
            payload: task.payload,
            enabled: task.enabled,
            last_run: None,
            created_at: now,
            updated_at: now,
        };
        guard.1.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update(&self, id: i64, task: NewScheduledTask) -> CoreResult<ScheduledTask> {
        let mut guard = self.lock()?;
        let record = guard
            .1
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("Scheduled task {id}")))?;
        record.name = task.name;
        record.task_type = task.task_type;
        record.cron_expression = task.cron_expression;
        record.payload = task.payload;
        record.enabled = task.enabled;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn delete(&self, id: i64) -> CoreResult<bool> {
        Ok(self.lock()?.1.remove(&id).is_some())
    }

    async fn get(&self, id: i64) -> CoreResult<Option<ScheduledTask>> {
        Ok(self.lock()?.1.get(&id).cloned())
    }

    async fn list_enabled(&self) -> CoreResult<Vec<ScheduledTask>> {
        Ok(self.lock()?.1.values().filter(|t| t.enabled).cloned().collect())
    }

    async fn mark_run(&self, id: i64, at: DateTime<Utc>) -> CoreResult<()> {
        if let Some(task) = self.lock()?.1.get_mut(&id) {
            task.last_run = Some(at);
        }
        Ok(())
    }
}

pub struct PgScheduledTaskStore {
    pool: DbPool,
}

impl PgScheduledTaskStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduledTaskStore for PgScheduledTaskStore {
    async fn create(&self, task: NewScheduledTask) -> CoreResult<ScheduledTask> {
        with_conn(&self.pool, move |conn| {
            Ok(diesel::insert_into(scheduled_tasks::table)
                .values(&task)
                .returning(ScheduledTask::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn update(&self, id: i64, task: NewScheduledTask) -> CoreResult<ScheduledTask> {
        with_conn(&self.pool, move |conn| {
            diesel::update(scheduled_tasks::table.find(id))
                .set((&task, scheduled_tasks::updated_at.eq(Utc::now())))
                .returning(ScheduledTask::as_returning())
                .get_result(conn)
                .optional()?
                .ok_or_else(|| CoreError::not_found(format!("Scheduled task {id}")))
        })
        .await
    }

    async fn delete(&self, id: i64) -> CoreResult<bool> {
        with_conn(&self.pool, move |conn| {
            Ok(diesel::delete(scheduled_tasks::table.find(id)).execute(conn)? > 0)
        })
        .await
    }

    async fn get(&self, id: i64) -> CoreResult<Option<ScheduledTask>> {
        with_conn(&self.pool, move |conn| {
            Ok(scheduled_tasks::table
                .find(id)
                .select(ScheduledTask::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn list_enabled(&self) -> CoreResult<Vec<ScheduledTask>> {
        with_conn(&self.pool, move |conn| {
            Ok(scheduled_tasks::table
                .filter(scheduled_tasks::enabled.eq(true))
                .order(scheduled_tasks::id.asc())
                .select(ScheduledTask::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn mark_run(&self, id: i64, at: DateTime<Utc>) -> CoreResult<()> {
        with_conn(&self.pool, move |conn| {
            diesel::update(scheduled_tasks::table.find(id))
                .set(scheduled_tasks::last_run.eq(Some(at)))
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}
