use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::models::{
    Attachment, NewAttachment, NewReply, NewTicket, Reply, Ticket, Watcher, WatcherTarget,
};
use crate::core::error::{CoreError, CoreResult};

/// Who sent a message, for "tickets this person is involved in" lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct SenderRef {
    pub user_id: Option<i64>,
    pub email: String,
}

#[async_trait]
pub trait TicketRepository: Send + Sync {
    async fn get_ticket(&self, id: i64) -> CoreResult<Option<Ticket>>;

    async fn find_by_external_reference(&self, reference: &str) -> CoreResult<Option<Ticket>>;

    async fn find_reply_by_external_reference(&self, reference: &str) -> CoreResult<Option<Reply>>;

    async fn find_by_ticket_number(&self, number: &str) -> CoreResult<Option<Ticket>>;

    /// Most recently updated open tickets where the sender is requester or watcher.
    async fn candidate_tickets(&self, sender: &SenderRef, limit: i64) -> CoreResult<Vec<Ticket>>;

    async fn create_ticket(&self, ticket: NewTicket) -> CoreResult<Ticket>;

    async fn update_status(
        &self,
        id: i64,
        status: &str,
        closed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> CoreResult<Ticket>;

    /// Inserts the reply and bumps the ticket's `updated_at`.
    async fn create_reply(&self, reply: NewReply) -> CoreResult<Reply>;

    /// Ordered by `(created_at, id)`.
    async fn replies(&self, ticket_id: i64) -> CoreResult<Vec<Reply>>;

    /// Moves every reply of `source` to `target` and marks `source` merged, atomically.
    async fn merge_tickets(&self, source: i64, target: i64, now: DateTime<Utc>) -> CoreResult<usize>;

    /// Creates `ticket` and moves `reply_ids` from `source` onto it, atomically.
    async fn split_ticket(
        &self,
        source: i64,
        ticket: NewTicket,
        reply_ids: &[i64],
    ) -> CoreResult<Ticket>;

    /// `false` when the pair already exists.
    async fn add_watcher(&self, ticket_id: i64, target: &WatcherTarget) -> CoreResult<bool>;

    async fn watchers(&self, ticket_id: i64) -> CoreResult<Vec<Watcher>>;

    async fn add_attachment(&self, attachment: NewAttachment) -> CoreResult<Attachment>;

    async fn attachments(&self, ticket_id: i64) -> CoreResult<Vec<Attachment>>;
}

#[derive(Default)]
struct MemoryState {
    last_id: i64,
    tickets: BTreeMap<i64, Ticket>,
    replies: BTreeMap<i64, Reply>,
    watchers: Vec<Watcher>,
    attachments: Vec<Attachment>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn ticket_mut(&mut self, id: i64) -> CoreResult<&mut Ticket> {
        self.tickets
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("Ticket {id}")))
    }

    fn insert_ticket(&mut self, new: NewTicket) -> Ticket {
        let now = Utc::now();
        let ticket = Ticket {
            id: self.next_id(),
            subject: new.subject,
            description: new.description,
            status: new.status,
            priority: new.priority,
            category: new.category,
            module_slug: new.module_slug,
            company_id: new.company_id,
            requester_id: new.requester_id,
            ticket_number: new.ticket_number,
            external_reference: new.external_reference,
            merged_into_ticket_id: None,
            split_from_ticket_id: new.split_from_ticket_id,
            ai_tags: Vec::new(),
            created_at: now,
            updated_at: now,
            closed_at: new.closed_at,
        };
        self.tickets.insert(ticket.id, ticket.clone());
        ticket
    }
}

/// In-process repository for tests and dry runs.
#[derive(Default)]
pub struct MemoryTicketRepository {
    state: Mutex<MemoryState>,
}

impl MemoryTicketRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::internal("Ticket store lock poisoned"))
    }

    pub fn all_tickets(&self) -> CoreResult<Vec<Ticket>> {
        Ok(self.lock()?.tickets.values().cloned().collect())
    }

    /// Overwrites the stored ticket; used to arrange fixtures.
    pub fn put_ticket(&self, ticket: Ticket) -> CoreResult<()> {
        let mut state = self.lock()?;
        state.last_id = state.last_id.max(ticket.id);
        state.tickets.insert(ticket.id, ticket);
        Ok(())
    }
}

#[async_trait]
impl TicketRepository for MemoryTicketRepository {
    async fn get_ticket(&self, id: i64) -> CoreResult<Option<Ticket>> {
        Ok(self.lock()?.tickets.get(&id).cloned())
    }

    async fn find_by_external_reference(&self, reference: &str) -> CoreResult<Option<Ticket>> {
        Ok(self
            .lock()?
            .tickets
            .values()
            .find(|t| t.external_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn find_reply_by_external_reference(&self, reference: &str) -> CoreResult<Option<Reply>> {
        Ok(self
            .lock()?
            .replies
            .values()
            .find(|r| r.external_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn find_by_ticket_number(&self, number: &str) -> CoreResult<Option<Ticket>> {
        Ok(self
            .lock()?
            .tickets
            .values()
            .find(|t| t.ticket_number.as_deref() == Some(number))
            .cloned())
    }

    async fn candidate_tickets(&self, sender: &SenderRef, limit: i64) -> CoreResult<Vec<Ticket>> {
        let state = self.lock()?;
        let watching = |ticket_id: i64| {
            state.watchers.iter().any(|w| {
                w.ticket_id == ticket_id
                    && (sender.user_id.is_some() && w.user_id == sender.user_id
                        || w.is(&WatcherTarget::Email(sender.email.clone())))
            })
        };
        let mut found: Vec<Ticket> = state
            .tickets
            .values()
            .filter(|t| !t.is_closed())
            .filter(|t| {
                (sender.user_id.is_some() && t.requester_id == sender.user_id) || watching(t.id)
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn create_ticket(&self, ticket: NewTicket) -> CoreResult<Ticket> {
        Ok(self.lock()?.insert_ticket(ticket))
    }

    async fn update_status(
        &self,
        id: i64,
        status: &str,
        closed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> CoreResult<Ticket> {
        let mut state = self.lock()?;
        let ticket = state.ticket_mut(id)?;
        ticket.status = status.to_string();
        ticket.closed_at = closed_at;
        ticket.updated_at = now;
        Ok(ticket.clone())
    }

    async fn create_reply(&self, reply: NewReply) -> CoreResult<Reply> {
        let mut state = self.lock()?;
        let now = Utc::now();
        state.ticket_mut(reply.ticket_id)?.updated_at = now;
        let record = Reply {
            id: state.next_id(),
            ticket_id: reply.ticket_id,
            author_id: reply.author_id,
            body: reply.body,
            is_internal: reply.is_internal,
            minutes_spent: reply.minutes_spent,
            is_billable: reply.is_billable,
            labour_type_id: reply.labour_type_id,
            external_reference: reply.external_reference,
            created_at: reply.created_at,
        };
        state.replies.insert(record.id, record.clone());
        Ok(record)
    }

    async fn replies(&self, ticket_id: i64) -> CoreResult<Vec<Reply>> {
        let state = self.lock()?;
        let mut replies: Vec<Reply> = state
            .replies
            .values()
            .filter(|r| r.ticket_id == ticket_id)
            .cloned()
            .collect();
        replies.sort_by_key(|r| (r.created_at, r.id));
        Ok(replies)
    }

    async fn merge_tickets(&self, source: i64, target: i64, now: DateTime<Utc>) -> CoreResult<usize> {
        let mut state = self.lock()?;
        state.ticket_mut(target)?.updated_at = now;
        let merged = state.ticket_mut(source)?;
        merged.merged_into_ticket_id = Some(target);
        merged.updated_at = now;
        let mut moved = 0;
        for reply in state.replies.values_mut().filter(|r| r.ticket_id == source) {
            reply.ticket_id = target;
            moved += 1;
        }
        Ok(moved)
    }

    async fn split_ticket(
        &self,
        source: i64,
        ticket: NewTicket,
        reply_ids: &[i64],
    ) -> CoreResult<Ticket> {
        let mut state = self.lock()?;
        for id in reply_ids {
            match state.replies.get(id) {
                Some(r) if r.ticket_id == source => {}
                _ => {
                    return Err(CoreError::validation(format!(
                        "Reply {id} does not belong to ticket {source}"
                    )))
                }
            }
        }
        let created = state.insert_ticket(ticket);
        for id in reply_ids {
            if let Some(reply) = state.replies.get_mut(id) {
                reply.ticket_id = created.id;
            }
        }
        Ok(created)
    }

    async fn add_watcher(&self, ticket_id: i64, target: &WatcherTarget) -> CoreResult<bool> {
        let mut state = self.lock()?;
        if state
            .watchers
            .iter()
            .any(|w| w.ticket_id == ticket_id && w.is(target))
        {
            return Ok(false);
        }
        let (user_id, email) = match target {
            WatcherTarget::User(id) => (Some(*id), None),
            WatcherTarget::Email(email) => (None, Some(email.clone())),
        };
        let watcher = Watcher {
            id: state.next_id(),
            ticket_id,
            user_id,
            email,
            created_at: Utc::now(),
        };
        state.watchers.push(watcher);
        Ok(true)
    }

    async fn watchers(&self, ticket_id: i64) -> CoreResult<Vec<Watcher>> {
        Ok(self
            .lock()?
            .watchers
            .iter()
            .filter(|w| w.ticket_id == ticket_id)
            .cloned()
            .collect())
    }

    async fn add_attachment(&self, attachment: NewAttachment) -> CoreResult<Attachment> {
        let mut state = self.lock()?;
        let record = Attachment {
            id: state.next_id(),
            ticket_id: attachment.ticket_id,
            reply_id: attachment.reply_id,
            filename: attachment.filename,
            stored_name: attachment.stored_name,
            content_type: attachment.content_type,
            size_bytes: attachment.size_bytes,
            access_level: attachment.access_level,
            created_at: Utc::now(),
        };
        state.attachments.push(record.clone());
        Ok(record)
    }

    async fn attachments(&self, ticket_id: i64) -> CoreResult<Vec<Attachment>> {
        Ok(self
            .lock()?
            .attachments
            .iter()
            .filter(|a| a.ticket_id == ticket_id)
            .cloned()
            .collect())
    }
}
