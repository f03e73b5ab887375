use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::core::error::{CoreError, CoreResult};
use crate::core::shared::schema::imap_messages;
use crate::core::shared::utils::{with_conn, DbPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Imported,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imported => "imported",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "imported" => Some(Self::Imported),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = imap_messages)]
pub struct MessageRecord {
    pub id: i64,
    pub account_id: i64,
    pub message_uid: i64,
    pub status: String,
    pub ticket_id: Option<i64>,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn is_imported(&self) -> bool {
        MessageStatus::parse(&self.status) == Some(MessageStatus::Imported)
    }
}

#[derive(Debug, Clone, PartialEq, Insertable, AsChangeset)]
#[diesel(table_name = imap_messages)]
#[diesel(treat_none_as_null = true)]
struct MessageRecordRow {
    account_id: i64,
    message_uid: i64,
    status: String,
    ticket_id: Option<i64>,
    error: Option<String>,
    processed_at: DateTime<Utc>,
}

/// Per-UID processing outcomes, unique on `(account, uid)`.
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn get(&self, account_id: i64, uid: u32) -> CoreResult<Option<MessageRecord>>;

    /// Inserts or overwrites the record for `(account, uid)`.
    async fn record(
        &self,
        account_id: i64,
        uid: u32,
        status: MessageStatus,
        ticket_id: Option<i64>,
        error: Option<String>,
    ) -> CoreResult<MessageRecord>;
}

#[derive(Default)]
pub struct MemoryMessageLog {
    records: Mutex<(i64, HashMap<(i64, u32), MessageRecord>)>,
}

impl MemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, (i64, HashMap<(i64, u32), MessageRecord>)>> {
        self.records
            .lock()
            .map_err(|_| CoreError::internal("Message log lock poisoned"))
    }

    pub fn all(&self, account_id: i64) -> CoreResult<Vec<MessageRecord>> {
        let mut records: Vec<MessageRecord> = self
            .lock()?
            .1
            .values()
            .filter(|r| r.account_id == account_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.message_uid);
        Ok(records)
    }
}

#[async_trait]
impl MessageLog for MemoryMessageLog {
    async fn get(&self, account_id: i64, uid: u32) -> CoreResult<Option<MessageRecord>> {
        Ok(self.lock()?.1.get(&(account_id, uid)).cloned())
    }

    async fn record(
        &self,
        account_id: i64,
        uid: u32,
        status: MessageStatus,
        ticket_id: Option<i64>,
        error: Option<String>,
    ) -> CoreResult<MessageRecord> {
        let mut guard = self.lock()?;
        let id = match guard.1.get(&(account_id, uid)) {
            Some(existing) => existing.id,
            None => {
                guard.0 += 1;
                guard.0
            }
        };
        let record = MessageRecord {
            id,
            account_id,
            message_uid: i64::from(uid),
            status: status.as_str().to_string(),
            ticket_id,
            error,
            processed_at: Utc::now(),
        };
        guard.1.insert((account_id, uid), record.clone());
        Ok(record)
    }
}

pub struct PgMessageLog {
    pool: DbPool,
}

impl PgMessageLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageLog for PgMessageLog {
    async fn get(&self, account_id: i64, uid: u32) -> CoreResult<Option<MessageRecord>> {
        with_conn(&self.pool, move |conn| {
            Ok(imap_messages::table
                .filter(imap_messages::account_id.eq(account_id))
                .filter(imap_messages::message_uid.eq(i64::from(uid)))
                .select(MessageRecord::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn record(
        &self,
        account_id: i64,
        uid: u32,
        status: MessageStatus,
        ticket_id: Option<i64>,
        error: Option<String>,
    ) -> CoreResult<MessageRecord> {
        let row = MessageRecordRow {
            account_id,
            message_uid: i64::from(uid),
            status: status.as_str().to_string(),
            ticket_id,
            error,
            processed_at: Utc::now(),
        };
        with_conn(&self.pool, move |conn| {
            Ok(diesel::insert_into(imap_messages::table)
                .values(&row)
                .on_conflict((imap_messages::account_id, imap_messages::message_uid))
                .do_update()
                .set(&row)
                .returning(MessageRecord::as_returning())
                .get_result(conn)?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_overwrites_by_account_and_uid() {
        let log = MemoryMessageLog::new();
        let first = log
            .record(1, 7, MessageStatus::Error, None, Some("boom".to_string()))
            .await
            .unwrap();
        assert!(!first.is_imported());

        let second = log.record(1, 7, MessageStatus::Imported, Some(3), None).await.unwrap();
        assert_eq!(second.id, first.id);
        assert!(second.is_imported());
        assert_eq!(second.error, None);

        log.record(2, 7, MessageStatus::Imported, Some(4), None).await.unwrap();
        assert_eq!(log.all(1).unwrap().len(), 1);
        assert_eq!(log.get(2, 7).await.unwrap().unwrap().ticket_id, Some(4));
        assert!(log.get(1, 8).await.unwrap().is_none());
    }
}
