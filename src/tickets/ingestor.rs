use log::{debug, info, warn};
use std::sync::Arc;

use super::attachments::AttachmentStore;
use super::classifier::{Classification, InboundMessage, MessageClassifier};
use super::models::{NewTicket, Reply, Ticket, WatcherTarget};
use super::repository::TicketRepository;
use super::sanitizer::HtmlSanitizer;
use super::service::{ReplyDraft, TicketService};
use crate::core::error::CoreResult;

pub const EMAIL_CATEGORY: &str = "email";

/// The mailbox a message arrived through.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageOrigin {
    /// The mailbox login; never added as a watcher.
    pub mailbox_username: String,
    pub module_slug: String,
    pub default_company_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Created(Ticket),
    Replied { ticket_id: i64, reply: Reply },
    /// Matched a ticket but the body sanitised to nothing.
    EmptyReply { ticket_id: i64 },
    /// The `Message-ID` was already ingested.
    Duplicate { ticket_id: i64 },
}

impl IngestOutcome {
    pub fn ticket_id(&self) -> i64 {
        match self {
            Self::Created(ticket) => ticket.id,
            Self::Replied { ticket_id, .. }
            | Self::EmptyReply { ticket_id }
            | Self::Duplicate { ticket_id } => *ticket_id,
        }
    }
}

/// Turns classified inbound messages into tickets and replies.
pub struct TicketIngestor {
    service: Arc<TicketService>,
    classifier: MessageClassifier,
    sanitizer: Arc<dyn HtmlSanitizer>,
    attachments: AttachmentStore,
}

impl TicketIngestor {
    pub fn new(
        service: Arc<TicketService>,
        classifier: MessageClassifier,
        sanitizer: Arc<dyn HtmlSanitizer>,
        attachments: AttachmentStore,
    ) -> Self {
        Self {
            service,
            classifier,
            sanitizer,
            attachments,
        }
    }

    fn repo(&self) -> &dyn TicketRepository {
        self.service.repository().as_ref()
    }

    pub async fn ingest(&self, message: &InboundMessage, origin: &MessageOrigin) -> CoreResult<IngestOutcome> {
        if let Some(ticket_id) = self.already_ingested(message).await? {
            debug!(
                "Message {:?} already ingested into ticket {}",
                message.message_id, ticket_id
            );
            return Ok(IngestOutcome::Duplicate { ticket_id });
        }

        let requester = self
            .classifier
            .resolve_requester(&message.from, origin.default_company_id)
            .await?;

        match self.classifier.classify(message).await? {
            Classification::Reply(ticket) => {
                let draft = ReplyDraft {
                    body_html: message.body_html.clone(),
                    author_id: requester.requester_id,
                    external_reference: message.message_id.clone(),
                    created_at: message.date,
                    ..Default::default()
                };
                match self.service.try_add_reply(ticket.id, draft).await? {
                    Some(reply) => {
                        self.attachments
                            .persist_all(self.repo(), reply.ticket_id, Some(reply.id), &message.attachments)
                            .await;
                        info!("Appended reply {} to ticket {}", reply.id, reply.ticket_id);
                        Ok(IngestOutcome::Replied {
                            ticket_id: reply.ticket_id,
                            reply,
                        })
                    }
                    None => {
                        warn!(
                            "Ignoring empty reply {:?} for ticket {}",
                            message.message_id, ticket.id
                        );
                        Ok(IngestOutcome::EmptyReply {
                            ticket_id: ticket.id,
                        })
                    }
                }
            }
            Classification::NewTicket => {
                let body = self.sanitizer.sanitize(&message.body_html).safe_html;
                let description = if message.from.is_empty() {
                    body
                } else {
                    format!("From: {}\n\n{}", message.from, body)
                };
                let subject = if message.subject.trim().is_empty() {
                    "(no subject)".to_string()
                } else {
                    message.subject.trim().to_string()
                };

                let mut ticket = NewTicket::new(subject, "");
                ticket.description = Some(description);
                ticket.category = Some(EMAIL_CATEGORY.to_string());
                ticket.module_slug = Some(origin.module_slug.clone());
                ticket.company_id = requester.company_id;
                ticket.requester_id = requester.requester_id;
                ticket.external_reference = message.message_id.clone();

                let created = self
                    .service
                    .create_ticket(ticket, requester.requester_id)
                    .await?;
                self.add_cc_watchers(created.id, message, origin).await;
                self.attachments
                    .persist_all(self.repo(), created.id, None, &message.attachments)
                    .await;
                Ok(IngestOutcome::Created(created))
            }
        }
    }

    async fn already_ingested(&self, message: &InboundMessage) -> CoreResult<Option<i64>> {
        let Some(message_id) = message.message_id.as_deref() else {
            return Ok(None);
        };
        if let Some(ticket) = self.repo().find_by_external_reference(message_id).await? {
            return Ok(Some(ticket.id));
        }
        Ok(self
            .repo()
            .find_reply_by_external_reference(message_id)
            .await?
            .map(|reply| reply.ticket_id))
    }

    async fn add_cc_watchers(&self, ticket_id: i64, message: &InboundMessage, origin: &MessageOrigin) {
        for address in &message.cc {
            if address.eq_ignore_ascii_case(&origin.mailbox_username)
                || address.eq_ignore_ascii_case(&message.from)
            {
                continue;
            }
            if let Err(e) = self
                .service
                .add_watcher(ticket_id, WatcherTarget::Email(address.clone()))
                .await
            {
                warn!("Failed to add watcher {} to ticket {}: {}", address, ticket_id, e);
            }
        }
    }
}
