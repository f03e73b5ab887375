use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::status::is_closed_status;
use crate::core::shared::schema::{
    companies, company_staff, ticket_attachments, ticket_replies, ticket_watchers, tickets, users,
};

#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, QueryableByName, Selectable, Identifiable,
)]
#[diesel(table_name = tickets)]
pub struct Ticket {
    pub id: i64,
    pub subject: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: String,
    pub category: Option<String>,
    pub module_slug: Option<String>,
    pub company_id: Option<i64>,
    pub requester_id: Option<i64>,
    pub ticket_number: Option<String>,
    pub external_reference: Option<String>,
    pub merged_into_ticket_id: Option<i64>,
    pub split_from_ticket_id: Option<i64>,
    pub ai_tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Ticket {
    pub fn is_closed(&self) -> bool {
        is_closed_status(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = tickets)]
pub struct NewTicket {
    pub subject: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: String,
    pub category: Option<String>,
    pub module_slug: Option<String>,
    pub company_id: Option<i64>,
    pub requester_id: Option<i64>,
    pub ticket_number: Option<String>,
    pub external_reference: Option<String>,
    pub split_from_ticket_id: Option<i64>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl NewTicket {
    pub fn new(subject: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            description: None,
            status: status.into(),
            priority: "normal".to_string(),
            category: None,
            module_slug: None,
            company_id: None,
            requester_id: None,
            ticket_number: None,
            external_reference: None,
            split_from_ticket_id: None,
            closed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = ticket_replies)]
pub struct Reply {
    pub id: i64,
    pub ticket_id: i64,
    pub author_id: Option<i64>,
    pub body: String,
    pub is_internal: bool,
    pub minutes_spent: Option<i32>,
    pub is_billable: bool,
    pub labour_type_id: Option<i64>,
    pub external_reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = ticket_replies)]
pub struct NewReply {
    pub ticket_id: i64,
    pub author_id: Option<i64>,
    pub body: String,
    pub is_internal: bool,
    pub minutes_spent: Option<i32>,
    pub is_billable: bool,
    pub labour_type_id: Option<i64>,
    pub external_reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewReply {
    pub fn new(ticket_id: i64, body: impl Into<String>) -> Self {
        Self {
            ticket_id,
            author_id: None,
            body: body.into(),
            is_internal: false,
            minutes_spent: None,
            is_billable: false,
            labour_type_id: None,
            external_reference: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum WatcherTarget {
    User(i64),
    Email(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = ticket_watchers)]
pub struct Watcher {
    pub id: i64,
    pub ticket_id: i64,
    pub user_id: Option<i64>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Watcher {
    pub fn is(&self, target: &WatcherTarget) -> bool {
        match target {
            WatcherTarget::User(id) => self.user_id == Some(*id),
            WatcherTarget::Email(email) => self
                .email
                .as_deref()
                .is_some_and(|e| e.eq_ignore_ascii_case(email)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = ticket_attachments)]
pub struct Attachment {
    pub id: i64,
    pub ticket_id: i64,
    pub reply_id: Option<i64>,
    pub filename: String,
    pub stored_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub access_level: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = ticket_attachments)]
pub struct NewAttachment {
    pub ticket_id: i64,
    pub reply_id: Option<i64>,
    pub filename: String,
    pub stored_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub access_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub company_id: Option<i64>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = companies)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub email_domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = company_staff)]
pub struct StaffMember {
    pub id: i64,
    pub company_id: i64,
    pub user_id: Option<i64>,
    pub email: String,
    pub name: Option<String>,
}
