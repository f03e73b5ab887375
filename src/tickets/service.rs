use chrono::{DateTime, Utc};
use log::{info, warn};
use std::sync::Arc;

use super::context::ticket_context;
use super::directory::ContactDirectory;
use super::events::{DomainEventSink, TICKET_CREATED, TICKET_UPDATED};
use super::merge::{resolve_merge_chain, MergeResolution};
use super::models::{NewReply, NewTicket, Reply, Ticket, WatcherTarget};
use super::repository::TicketRepository;
use super::sanitizer::HtmlSanitizer;
use super::status::{is_closed_status, StatusSet};
use crate::core::error::{CoreError, CoreResult};

/// Reply as submitted, before sanitising.
#[derive(Debug, Clone, Default)]
pub struct ReplyDraft {
    pub body_html: String,
    pub author_id: Option<i64>,
    pub is_internal: bool,
    pub minutes_spent: Option<i32>,
    pub is_billable: bool,
    pub labour_type_id: Option<i64>,
    pub external_reference: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl ReplyDraft {
    pub fn new(body_html: impl Into<String>) -> Self {
        Self {
            body_html: body_html.into(),
            ..Default::default()
        }
    }
}

/// Ticket operations that keep the status, merge and reply invariants and
/// raise `tickets.*` events.
pub struct TicketService {
    repo: Arc<dyn TicketRepository>,
    directory: Arc<dyn ContactDirectory>,
    sanitizer: Arc<dyn HtmlSanitizer>,
    statuses: StatusSet,
    events: Arc<dyn DomainEventSink>,
    merge_chain_depth: usize,
}

impl TicketService {
    pub fn new(
        repo: Arc<dyn TicketRepository>,
        directory: Arc<dyn ContactDirectory>,
        sanitizer: Arc<dyn HtmlSanitizer>,
        statuses: StatusSet,
        events: Arc<dyn DomainEventSink>,
    ) -> Self {
        Self {
            repo,
            directory,
            sanitizer,
            statuses,
            events,
            merge_chain_depth: 10,
        }
    }

    pub fn with_merge_chain_depth(mut self, depth: usize) -> Self {
        self.merge_chain_depth = depth;
        self
    }

    pub fn repository(&self) -> &Arc<dyn TicketRepository> {
        &self.repo
    }

    pub fn statuses(&self) -> &StatusSet {
        &self.statuses
    }

    pub async fn get(&self, id: i64) -> CoreResult<Ticket> {
        self.repo
            .get_ticket(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("Ticket {id}")))
    }

    /// An empty status means the configured default.
    pub async fn create_ticket(&self, mut ticket: NewTicket, actor_id: Option<i64>) -> CoreResult<Ticket> {
        if ticket.subject.trim().is_empty() {
            return Err(CoreError::validation("Ticket subject must not be empty"));
        }
        ticket.status = if ticket.status.is_empty() {
            self.statuses.default_status()
        } else {
            self.statuses.validate(&ticket.status)?
        };
        ticket.closed_at = is_closed_status(&ticket.status).then(Utc::now);

        let created = self.repo.create_ticket(ticket).await?;
        info!("Created ticket {} '{}'", created.id, created.subject);
        self.emit(TICKET_CREATED, &created, actor_id).await;
        Ok(created)
    }

    pub async fn set_status(&self, id: i64, status: &str, actor_id: Option<i64>) -> CoreResult<Ticket> {
        let status = self.statuses.validate(status)?;
        let current = self.get(id).await?;
        let now = Utc::now();
        let closed_at = match (is_closed_status(&status), current.closed_at) {
            (true, Some(existing)) => Some(existing),
            (true, None) => Some(now),
            (false, _) => None,
        };
        let updated = self.repo.update_status(id, &status, closed_at, now).await?;
        self.emit(TICKET_UPDATED, &updated, actor_id).await;
        Ok(updated)
    }

    pub async fn add_reply(&self, ticket_id: i64, draft: ReplyDraft) -> CoreResult<Reply> {
        self.try_add_reply(ticket_id, draft)
            .await?
            .ok_or_else(|| CoreError::validation("Reply body is empty"))
    }

    /// `None` when the sanitised body has neither text nor an image.
    /// Replies always land on the end of the ticket's merge chain.
    pub async fn try_add_reply(&self, ticket_id: i64, draft: ReplyDraft) -> CoreResult<Option<Reply>> {
        if draft.minutes_spent.is_some_and(|m| m < 0) {
            return Err(CoreError::validation("minutes_spent must not be negative"));
        }
        let ticket = self.resolve(ticket_id).await?;
        let sanitized = self.sanitizer.sanitize(&draft.body_html);
        if !sanitized.is_meaningful() {
            return Ok(None);
        }

        let reply = self
            .repo
            .create_reply(NewReply {
                ticket_id: ticket.id,
                author_id: draft.author_id,
                body: sanitized.safe_html,
                is_internal: draft.is_internal,
                minutes_spent: draft.minutes_spent,
                is_billable: draft.is_billable,
                labour_type_id: draft.labour_type_id,
                external_reference: draft.external_reference,
                created_at: draft.created_at.unwrap_or_else(Utc::now),
            })
            .await?;

        let ticket = self.get(ticket.id).await?;
        self.emit(TICKET_UPDATED, &ticket, draft.author_id).await;
        Ok(Some(reply))
    }

    /// Moves all replies of `source` onto the end of `target`'s merge chain.
    pub async fn merge(&self, source: i64, target: i64, actor_id: Option<i64>) -> CoreResult<Ticket> {
        if source == target {
            return Err(CoreError::validation("Cannot merge a ticket into itself"));
        }
        let source_ticket = self.get(source).await?;
        if source_ticket.merged_into_ticket_id.is_some() {
            return Err(CoreError::validation(format!(
                "Ticket {source} is already merged"
            )));
        }
        let destination = self.resolve(target).await?;
        if destination.id == source {
            return Err(CoreError::validation(format!(
                "Ticket {target} is already merged into ticket {source}"
            )));
        }

        let moved = self
            .repo
            .merge_tickets(source, destination.id, Utc::now())
            .await?;
        info!(
            "Merged ticket {} into {} ({} replies moved)",
            source, destination.id, moved
        );
        let destination = self.get(destination.id).await?;
        self.emit(TICKET_UPDATED, &destination, actor_id).await;
        Ok(destination)
    }

    /// Creates a ticket from `reply_ids` of `source`, inheriting requester and company.
    pub async fn split(
        &self,
        source: i64,
        reply_ids: &[i64],
        subject: &str,
        actor_id: Option<i64>,
    ) -> CoreResult<Ticket> {
        if reply_ids.is_empty() {
            return Err(CoreError::validation("Select at least one reply to split"));
        }
        if subject.trim().is_empty() {
            return Err(CoreError::validation("Ticket subject must not be empty"));
        }
        let original = self.get(source).await?;
        let mut ticket = NewTicket::new(subject.trim(), self.statuses.default_status());
        ticket.priority = original.priority.clone();
        ticket.category = original.category.clone();
        ticket.module_slug = original.module_slug.clone();
        ticket.company_id = original.company_id;
        ticket.requester_id = original.requester_id;
        ticket.split_from_ticket_id = Some(source);

        let created = self.repo.split_ticket(source, ticket, reply_ids).await?;
        info!(
            "Split {} replies from ticket {} into {}",
            reply_ids.len(),
            source,
            created.id
        );
        self.emit(TICKET_CREATED, &created, actor_id).await;
        Ok(created)
    }

    pub async fn add_watcher(&self, ticket_id: i64, target: WatcherTarget) -> CoreResult<bool> {
        let target = match target {
            WatcherTarget::Email(email) => {
                let email = email.trim().to_string();
                if !email.contains('@') {
                    return Err(CoreError::validation(format!(
                        "Invalid watcher address '{email}'"
                    )));
                }
                WatcherTarget::Email(email)
            }
            user => user,
        };
        self.get(ticket_id).await?;
        self.repo.add_watcher(ticket_id, &target).await
    }

    async fn resolve(&self, ticket_id: i64) -> CoreResult<Ticket> {
        match resolve_merge_chain(self.repo.as_ref(), ticket_id, self.merge_chain_depth).await? {
            MergeResolution::Resolved(ticket) => Ok(ticket),
            MergeResolution::NotFound => Err(CoreError::not_found(format!("Ticket {ticket_id}"))),
            MergeResolution::CycleDetected => Err(CoreError::Integrity(format!(
                "Merge chain of ticket {ticket_id} is cyclic"
            ))),
        }
    }

    /// Failures are logged; the ticket change itself stands.
    async fn emit(&self, name: &str, ticket: &Ticket, actor_id: Option<i64>) {
        let context = match ticket_context(
            self.repo.as_ref(),
            self.directory.as_ref(),
            ticket,
            actor_id,
        )
        .await
        {
            Ok(context) => context,
            Err(e) => {
                warn!("Failed to build context for ticket {}: {}", ticket.id, e);
                return;
            }
        };
        if let Err(e) = self.events.emit(name, context).await {
            warn!("Failed to emit {} for ticket {}: {}", name, ticket.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::tickets::directory::MemoryContactDirectory;
    use crate::tickets::events::RecordingEventSink;
    use crate::tickets::repository::MemoryTicketRepository;
    use crate::tickets::sanitizer::AllowlistSanitizer;

    struct Fixture {
        repo: Arc<MemoryTicketRepository>,
        events: Arc<RecordingEventSink>,
        service: TicketService,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryTicketRepository::new());
        let events = Arc::new(RecordingEventSink::new());
        let service = TicketService::new(
            repo.clone(),
            Arc::new(MemoryContactDirectory::new()),
            Arc::new(AllowlistSanitizer::new()),
            StatusSet::default(),
            events.clone(),
        );
        Fixture {
            repo,
            events,
            service,
        }
    }

    async fn open_ticket(f: &Fixture, subject: &str) -> Ticket {
        f.service
            .create_ticket(NewTicket::new(subject, ""), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_uses_default_status_and_emits() {
        let f = fixture();
        let ticket = open_ticket(&f, "Printer down").await;
        assert_eq!(ticket.status, "open");
        assert_eq!(ticket.priority, "normal");
        assert!(ticket.closed_at.is_none());
        assert_eq!(f.events.names().unwrap(), vec!["tickets.created"]);
    }

    #[tokio::test]
    async fn test_set_status_maintains_closed_at() {
        let f = fixture();
        let ticket = open_ticket(&f, "Printer down").await;

        let resolved = f.service.set_status(ticket.id, "Resolved", None).await.unwrap();
        assert_eq!(resolved.status, "resolved");
        let closed_at = resolved.closed_at.unwrap();

        let closed = f.service.set_status(ticket.id, "closed", None).await.unwrap();
        assert_eq!(closed.closed_at, Some(closed_at));

        let reopened = f.service.set_status(ticket.id, "open", None).await.unwrap();
        assert!(reopened.closed_at.is_none());

        let err = f.service.set_status(ticket.id, "archived", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_empty_reply_rejected() {
        let f = fixture();
        let ticket = open_ticket(&f, "Printer down").await;
        let err = f
            .service
            .add_reply(ticket.id, ReplyDraft::new("<p> </p><script>x</script>"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Validation error: Reply body is empty");

        let reply = f
            .service
            .add_reply(ticket.id, ReplyDraft::new("<p>Still broken</p>"))
            .await
            .unwrap();
        assert_eq!(reply.body, "<p>Still broken</p>");

        let mut negative = ReplyDraft::new("x");
        negative.minutes_spent = Some(-5);
        assert!(f.service.add_reply(ticket.id, negative).await.is_err());
    }

    #[tokio::test]
    async fn test_merge_moves_replies_and_redirects_new_ones() {
        let f = fixture();
        let a = open_ticket(&f, "A").await;
        let b = open_ticket(&f, "B").await;
        f.service.add_reply(a.id, ReplyDraft::new("one")).await.unwrap();
        f.service.add_reply(a.id, ReplyDraft::new("two")).await.unwrap();

        let target = f.service.merge(a.id, b.id, None).await.unwrap();
        assert_eq!(target.id, b.id);
        assert_eq!(f.repo.replies(b.id).await.unwrap().len(), 2);
        assert!(f.repo.replies(a.id).await.unwrap().is_empty());
        assert_eq!(
            f.service.get(a.id).await.unwrap().merged_into_ticket_id,
            Some(b.id)
        );

        let late = f.service.add_reply(a.id, ReplyDraft::new("three")).await.unwrap();
        assert_eq!(late.ticket_id, b.id);
    }

    #[tokio::test]
    async fn test_merge_rejects_self_and_cycles() {
        let f = fixture();
        let a = open_ticket(&f, "A").await;
        let b = open_ticket(&f, "B").await;
        assert!(f.service.merge(a.id, a.id, None).await.is_err());

        f.service.merge(a.id, b.id, None).await.unwrap();
        let err = f.service.merge(b.id, a.id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_split_moves_selected_replies() {
        let f = fixture();
        let source = open_ticket(&f, "Mixed").await;
        let keep = f.service.add_reply(source.id, ReplyDraft::new("keep")).await.unwrap();
        let moved = f.service.add_reply(source.id, ReplyDraft::new("move")).await.unwrap();

        let created = f
            .service
            .split(source.id, &[moved.id], "Separate issue", None)
            .await
            .unwrap();
        assert_eq!(created.split_from_ticket_id, Some(source.id));
        let left: Vec<i64> = f.repo.replies(source.id).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(left, vec![keep.id]);
        assert_eq!(f.repo.replies(created.id).await.unwrap()[0].id, moved.id);

        let err = f
            .service
            .split(source.id, &[moved.id], "Again", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_watchers_are_unique_per_pair() {
        let f = fixture();
        let ticket = open_ticket(&f, "A").await;
        let email = WatcherTarget::Email("cc@acme.example".to_string());
        assert!(f.service.add_watcher(ticket.id, email.clone()).await.unwrap());
        assert!(!f
            .service
            .add_watcher(ticket.id, WatcherTarget::Email("CC@acme.example".to_string()))
            .await
            .unwrap());
        assert!(f.service.add_watcher(ticket.id, WatcherTarget::User(3)).await.unwrap());
        assert!(f
            .service
            .add_watcher(ticket.id, WatcherTarget::Email("nobody".to_string()))
            .await
            .is_err());
        assert_eq!(f.repo.watchers(ticket.id).await.unwrap().len(), 2);
    }
}
