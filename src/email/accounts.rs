use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::core::error::{CoreError, CoreResult};
use crate::core::shared::schema::imap_accounts;
use crate::core::shared::utils::{with_conn, DbPool};

pub const IMAPS_PORT: i32 = 993;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = imap_accounts)]
pub struct MailboxAccount {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_encrypted: String,
    pub folder: String,
    pub schedule: String,
    pub process_unread_only: bool,
    pub mark_as_read: bool,
    pub sync_known_only: bool,
    /// Canonical JSON.
    pub filter_rule: Option<String>,
    pub priority: i32,
    pub active: bool,
    pub default_company_id: Option<i64>,
    pub module_slug: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub scheduled_task_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MailboxAccount {
    pub fn uses_implicit_tls(&self) -> bool {
        self.port == IMAPS_PORT
    }
}

/// Validated column values for insert and update.
#[derive(Debug, Clone, PartialEq, Insertable, AsChangeset)]
#[diesel(table_name = imap_accounts)]
#[diesel(treat_none_as_null = true)]
pub struct MailboxRecord {
    pub name: String,
    pub host: String,
    pub port: i32,
    pub username: String,
    pub password_encrypted: String,
    pub folder: String,
    pub schedule: String,
    pub process_unread_only: bool,
    pub mark_as_read: bool,
    pub sync_known_only: bool,
    pub filter_rule: Option<String>,
    pub priority: i32,
    pub active: bool,
    pub default_company_id: Option<i64>,
    pub module_slug: String,
}

/// Mailbox settings as submitted by an operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxInput {
    pub name: String,
    pub host: String,
    pub port: Option<i32>,
    pub username: String,
    /// Required on create; `None` keeps the stored password on update.
    pub password: Option<String>,
    pub folder: Option<String>,
    pub schedule: Option<String>,
    pub process_unread_only: bool,
    pub mark_as_read: bool,
    pub sync_known_only: bool,
    /// A JSON object or its text form.
    pub filter_rule: Option<Value>,
    pub priority: i32,
    pub active: Option<bool>,
    pub default_company_id: Option<i64>,
    pub module_slug: Option<String>,
}

#[async_trait]
pub trait MailboxStore: Send + Sync {
    async fn get(&self, id: i64) -> CoreResult<Option<MailboxAccount>>;

    /// Active accounts ordered by `(priority, id)`.
    async fn list_active(&self) -> CoreResult<Vec<MailboxAccount>>;

    async fn insert(&self, record: MailboxRecord) -> CoreResult<MailboxAccount>;

    async fn update(&self, id: i64, record: MailboxRecord) -> CoreResult<MailboxAccount>;

    async fn delete(&self, id: i64) -> CoreResult<bool>;

    async fn set_scheduled_task(&self, id: i64, task_id: Option<i64>) -> CoreResult<()>;

    async fn touch_synced(&self, id: i64, at: DateTime<Utc>) -> CoreResult<()>;
}

#[derive(Default)]
pub struct MemoryMailboxStore {
    accounts: Mutex<(i64, BTreeMap<i64, MailboxAccount>)>,
}

impl MemoryMailboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, (i64, BTreeMap<i64, MailboxAccount>)>> {
        self.accounts
            .lock()
            .map_err(|_| CoreError::internal("Mailbox store lock poisoned"))
    }
}

fn apply(account: &mut MailboxAccount, record: MailboxRecord) {
    account.name = record.name;
    account.host = record.host;
    account.port = record.port;
    account.username = record.username;
    account.password_encrypted = record.password_encrypted;
    account.folder = record.folder;
    account.schedule = record.schedule;
    account.process_unread_only = record.process_unread_only;
    account.mark_as_read = record.mark_as_read;
    account.sync_known_only = record.sync_known_only;
    account.filter_rule = record.filter_rule;
    account.priority = record.priority;
    account.active = record.active;
    account.default_company_id = record.default_company_id;
    account.module_slug = record.module_slug;
}

#[async_trait]
impl MailboxStore for MemoryMailboxStore {
    async fn get(&self, id: i64) -> CoreResult<Option<MailboxAccount>> {
        Ok(self.lock()?.1.get(&id).cloned())
    }

    async fn list_active(&self) -> CoreResult<Vec<MailboxAccount>> {
        let mut active: Vec<MailboxAccount> =
            self.lock()?.1.values().filter(|a| a.active).cloned().collect();
        active.sort_by_key(|a| (a.priority, a.id));
        Ok(active)
    }

    async fn insert(&self, record: MailboxRecord) -> CoreResult<MailboxAccount> {
        let mut guard = self.lock()?;
        guard.0 += 1;
        let now = Utc::now();
        let mut account = MailboxAccount {
            id: guard.0,
            name: String::new(),
            host: String::new(),
            port: IMAPS_PORT,
            username: String::new(),
            password_encrypted: String::new(),
            folder: String::new(),
            schedule: String::new(),
            process_unread_only: false,
            mark_as_read: false,
            sync_known_only: false,
            filter_rule: None,
            priority: 0,
            active: true,
            default_company_id: None,
            module_slug: String::new(),
            last_synced_at: None,
            scheduled_task_id: None,
            created_at: now,
            updated_at: now,
        };
        apply(&mut account, record);
        guard.1.insert(account.id, account.clone());
        Ok(account)
    }

    async fn update(&self, id: i64, record: MailboxRecord) -> CoreResult<MailboxAccount> {
        let mut guard = self.lock()?;
        let account = guard
            .1
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("Mailbox {id}")))?;
        apply(account, record);
        account.updated_at = Utc::now();
        Ok(account.clone())
    }

    async fn delete(&self, id: i64) -> CoreResult<bool> {
        Ok(self.lock()?.1.remove(&id).is_some())
    }

    async fn set_scheduled_task(&self, id: i64, task_id: Option<i64>) -> CoreResult<()> {
        let mut guard = self.lock()?;
        let account = guard
            .1
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("Mailbox {id}")))?;
        account.scheduled_task_id = task_id;
        Ok(())
    }

    async fn touch_synced(&self, id: i64, at: DateTime<Utc>) -> CoreResult<()> {
        if let Some(account) = self.lock()?.1.get_mut(&id) {
            account.last_synced_at = Some(at);
        }
        Ok(())
    }
}

pub struct PgMailboxStore {
    pool: DbPool,
}

impl PgMailboxStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MailboxStore for PgMailboxStore {
    async fn get(&self, id: i64) -> CoreResult<Option<MailboxAccount>> {
        with_conn(&self.pool, move |conn| {
            Ok(imap_accounts::table
                .find(id)
                .select(MailboxAccount::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn list_active(&self) -> CoreResult<Vec<MailboxAccount>> {
        with_conn(&self.pool, move |conn| {
            Ok(imap_accounts::table
                .filter(imap_accounts::active.eq(true))
                .order((imap_accounts::priority.asc(), imap_accounts::id.asc()))
                .select(MailboxAccount::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn insert(&self, record: MailboxRecord) -> CoreResult<MailboxAccount> {
        with_conn(&self.pool, move |conn| {
            Ok(diesel::insert_into(imap_accounts::table)
                .values(&record)
                .returning(MailboxAccount::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn update(&self, id: i64, record: MailboxRecord) -> CoreResult<MailboxAccount> {
        with_conn(&self.pool, move |conn| {
            diesel::update(imap_accounts::table.find(id))
                .set((&record, imap_accounts::updated_at.eq(Utc::now())))
                .returning(MailboxAccount::as_returning())
                .get_result(conn)
                .optional()?
                .ok_or_else(|| CoreError::not_found(format!("Mailbox {id}")))
        })
        .await
    }

    async fn delete(&self, id: i64) -> CoreResult<bool> {
        with_conn(&self.pool, move |conn| {
            Ok(diesel::delete(imap_accounts::table.find(id)).execute(conn)? > 0)
        })
        .await
    }

    async fn set_scheduled_task(&self, id: i64, task_id: Option<i64>) -> CoreResult<()> {
        with_conn(&self.pool, move |conn| {
            diesel::update(imap_accounts::table.find(id))
                .set(imap_accounts::scheduled_task_id.eq(task_id))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn touch_synced(&self, id: i64, at: DateTime<Utc>) -> CoreResult<()> {
        with_conn(&self.pool, move |conn| {
            diesel::update(imap_accounts::table.find(id))
                .set(imap_accounts::last_synced_at.eq(Some(at)))
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}
