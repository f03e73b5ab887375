use chrono::{DateTime, Utc};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use super::attachments::InboundAttachment;
use super::directory::ContactDirectory;
use super::models::Ticket;
use super::repository::{SenderRef, TicketRepository};
use crate::core::error::CoreResult;

static SYNCRO_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\(message id:\s*(\d+)\)").expect("valid syncro id regex")
});

/// Tried in order; the first hit wins.
static TICKET_NUMBER: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"#(\d+)", r"[Tt]icket[:\s]+(\d+)"]
        .iter()
        .map(|p| Regex::new(p).expect("valid ticket number regex"))
        .collect()
});

static SUBJECT_NOISE: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)^\s*((re|fwd?)\s*:\s*)+",
        r"\[[^\]]*\]",
        r"#\d+",
        r"(?i)ticket[:\s]+\d+",
        r"(?i)^\s*((re|fwd?)\s*:\s*)+",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid subject noise regex"))
    .collect()
});

const MIN_FUZZY_SUBJECT_CHARS: usize = 5;

/// A parsed email as the ticket pipeline sees it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    pub subject: String,
    /// Bare sender address.
    pub from: String,
    pub body_html: String,
    pub message_id: Option<String>,
    /// `In-Reply-To` followed by `References`, deduplicated.
    pub references: Vec<String>,
    pub cc: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    pub attachments: Vec<InboundAttachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Reply(Ticket),
    NewTicket,
}

/// How a reply target was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    Reference,
    SyncroId,
    TicketNumber,
    Subject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Requester {
    pub company_id: Option<i64>,
    pub requester_id: Option<i64>,
}

pub struct MessageClassifier {
    repo: Arc<dyn TicketRepository>,
    directory: Arc<dyn ContactDirectory>,
    fuzzy_candidates: i64,
}

impl MessageClassifier {
    pub fn new(
        repo: Arc<dyn TicketRepository>,
        directory: Arc<dyn ContactDirectory>,
        fuzzy_candidates: i64,
    ) -> Self {
        Self {
            repo,
            directory,
            fuzzy_candidates,
        }
    }

    pub async fn classify(&self, message: &InboundMessage) -> CoreResult<Classification> {
        Ok(match self.find_reply_target(message).await? {
            Some((ticket, reason)) => {
                debug!("Message matched ticket {} by {:?}", ticket.id, reason);
                Classification::Reply(ticket)
            }
            None => Classification::NewTicket,
        })
    }

    pub async fn find_reply_target(
        &self,
        message: &InboundMessage,
    ) -> CoreResult<Option<(Ticket, MatchReason)>> {
        for reference in &message.references {
            if let Some(ticket) = self.match_reference(reference).await? {
                return Ok(Some((ticket, MatchReason::Reference)));
            }
        }

        let syncro = extract_syncro_id(&message.subject).or_else(|| extract_syncro_id(&message.body_html));
        if let Some(id) = syncro {
            if let Some(ticket) = open(self.repo.find_by_external_reference(&id).await?) {
                return Ok(Some((ticket, MatchReason::SyncroId)));
            }
        }

        if let Some(number) = extract_ticket_number(&message.subject) {
            let mut found = self.repo.find_by_ticket_number(&number).await?;
            if found.is_none() {
                if let Ok(id) = number.parse::<i64>() {
                    found = self.repo.get_ticket(id).await?;
                }
            }
            if let Some(ticket) = open(found) {
                return Ok(Some((ticket, MatchReason::TicketNumber)));
            }
        }

        if let Some(ticket) = self.match_subject(message).await? {
            return Ok(Some((ticket, MatchReason::Subject)));
        }
        Ok(None)
    }

    async fn match_reference(&self, reference: &str) -> CoreResult<Option<Ticket>> {
        if let Some(ticket) = self.repo.find_by_external_reference(reference).await? {
            if !ticket.is_closed() {
                return Ok(Some(ticket));
            }
        }
        match self.repo.find_reply_by_external_reference(reference).await? {
            Some(reply) => Ok(open(self.repo.get_ticket(reply.ticket_id).await?)),
            None => Ok(None),
        }
    }

    async fn match_subject(&self, message: &InboundMessage) -> CoreResult<Option<Ticket>> {
        let wanted = normalize_subject(&message.subject);
        if wanted.chars().count() < MIN_FUZZY_SUBJECT_CHARS || message.from.is_empty() {
            return Ok(None);
        }
        let sender = SenderRef {
            user_id: self.directory.user_by_email(&message.from).await?.map(|u| u.id),
            email: message.from.clone(),
        };
        let candidates = self
            .repo
            .candidate_tickets(&sender, self.fuzzy_candidates)
            .await?;
        Ok(candidates
            .into_iter()
            .find(|t| !t.is_closed() && normalize_subject(&t.subject) == wanted))
    }

    /// Exact user, then company by domain plus staff, then the mailbox default.
    pub async fn resolve_requester(
        &self,
        from: &str,
        default_company_id: Option<i64>,
    ) -> CoreResult<Requester> {
        if let Some(user) = self.directory.user_by_email(from).await? {
            return Ok(Requester {
                company_id: user.company_id.or(default_company_id),
                requester_id: Some(user.id),
            });
        }
        if let Some((_, domain)) = from.rsplit_once('@') {
            if let Some(company) = self.directory.company_by_domain(domain).await? {
                let staff = self.directory.staff_by_email(company.id, from).await?;
                return Ok(Requester {
                    company_id: Some(company.id),
                    requester_id: staff.and_then(|s| s.user_id),
                });
            }
        }
        Ok(Requester {
            company_id: default_company_id,
            requester_id: None,
        })
    }
}

fn open(ticket: Option<Ticket>) -> Option<Ticket> {
    ticket.filter(|t| !t.is_closed())
}

pub fn extract_syncro_id(text: &str) -> Option<String> {
    SYNCRO_ID.captures(text).map(|c| c[1].to_string())
}

pub fn extract_ticket_number(subject: &str) -> Option<String> {
    TICKET_NUMBER
        .iter()
        .find_map(|re| re.captures(subject).map(|c| c[1].to_string()))
}

/// Strips reply/forward prefixes, bracketed tags and ticket numbers, then
/// collapses whitespace and lowercases.
pub fn normalize_subject(subject: &str) -> String {
    let mut text = subject.to_string();
    for re in SUBJECT_NOISE.iter() {
        text = re.replace_all(&text, " ").into_owned();
    }
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tickets::directory::MemoryContactDirectory;
    use crate::tickets::models::{NewReply, NewTicket, WatcherTarget};
    use crate::tickets::repository::MemoryTicketRepository;

    struct Fixture {
        repo: Arc<MemoryTicketRepository>,
        directory: Arc<MemoryContactDirectory>,
        classifier: MessageClassifier,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryTicketRepository::new());
        let directory = Arc::new(MemoryContactDirectory::new());
        let classifier = MessageClassifier::new(repo.clone(), directory.clone(), 20);
        Fixture {
            repo,
            directory,
            classifier,
        }
    }

    fn message(subject: &str, from: &str) -> InboundMessage {
        InboundMessage {
            subject: subject.to_string(),
            from: from.to_string(),
            body_html: "<p>hello</p>".to_string(),
            ..Default::default()
        }
    }

    async fn ticket(f: &Fixture, subject: &str, status: &str, f_edit: impl FnOnce(&mut NewTicket)) -> Ticket {
        let mut new = NewTicket::new(subject, status);
        f_edit(&mut new);
        f.repo.create_ticket(new).await.unwrap()
    }

    #[test]
    fn test_normalize_subject() {
        assert_eq!(normalize_subject("RE: Fwd:  [ACME]  Printer   DOWN"), "printer down");
        assert_eq!(normalize_subject("Re: issue #42"), "issue");
        assert_eq!(normalize_subject("Ticket: 17 re: Printer"), "printer");
    }

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(TICKET_NUMBER.len(), 2);
        assert_eq!(SUBJECT_NOISE.len(), 5);
        assert_eq!(extract_syncro_id("Re: hi (Message ID: 991)").as_deref(), Some("991"));
        assert_eq!(extract_syncro_id("no id here"), None);
    }

    #[test]
    fn test_ticket_number_pattern_order() {
        assert_eq!(extract_ticket_number("Re: issue #42").as_deref(), Some("42"));
        assert_eq!(extract_ticket_number("ticket 9 and #3").as_deref(), Some("3"));
        assert_eq!(extract_ticket_number("Ticket: 17").as_deref(), Some("17"));
        assert_eq!(extract_ticket_number("no numbers"), None);
        assert_eq!(
            extract_syncro_id("Update (Message ID: 5512)").as_deref(),
            Some("5512")
        );
    }

    #[tokio::test]
    async fn test_reference_match_on_ticket_and_reply() {
        let f = fixture();
        let t = ticket(&f, "Printer down", "open", |n| {
            n.external_reference = Some("<m1@x>".to_string())
        })
        .await;
        let mut reply = NewReply::new(t.id, "more");
        reply.external_reference = Some("<m2@x>".to_string());
        f.repo.create_reply(reply).await.unwrap();

        let mut msg = message("Still broken", "bob@else.example");
        msg.references = vec!["<m1@x>".to_string()];
        assert_eq!(f.classifier.classify(&msg).await.unwrap(), Classification::Reply(f.repo.get_ticket(t.id).await.unwrap().unwrap()));

        msg.references = vec!["<unknown@x>".to_string(), "<m2@x>".to_string()];
        match f.classifier.classify(&msg).await.unwrap() {
            Classification::Reply(found) => assert_eq!(found.id, t.id),
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_ticket_never_matches() {
        let f = fixture();
        ticket(&f, "Printer", "closed", |n| {
            n.ticket_number = Some("42".to_string());
            n.external_reference = Some("<m1@x>".to_string());
        })
        .await;

        let mut msg = message("Re: issue #42", "alice@acme.example");
        msg.references = vec!["<m1@x>".to_string()];
        assert_eq!(
            f.classifier.classify(&msg).await.unwrap(),
            Classification::NewTicket
        );
    }

    #[tokio::test]
    async fn test_ticket_number_falls_back_to_id() {
        let f = fixture();
        let t = ticket(&f, "VPN", "open", |_| {}).await;
        let msg = message(&format!("Re: ticket: {}", t.id), "x@y.example");
        let (found, reason) = f.classifier.find_reply_target(&msg).await.unwrap().unwrap();
        assert_eq!(found.id, t.id);
        assert_eq!(reason, MatchReason::TicketNumber);
    }

    #[tokio::test]
    async fn test_syncro_id_in_body() {
        let f = fixture();
        let t = ticket(&f, "Imported", "open", |n| {
            n.external_reference = Some("5512".to_string())
        })
        .await;
        let mut msg = message("Update", "x@y.example");
        msg.body_html = "<p>(message id: 5512)</p>".to_string();
        let (found, reason) = f.classifier.find_reply_target(&msg).await.unwrap().unwrap();
        assert_eq!(found.id, t.id);
        assert_eq!(reason, MatchReason::SyncroId);
    }

    #[tokio::test]
    async fn test_fuzzy_subject_requires_involvement() {
        let f = fixture();
        let alice = f.directory.add_user("alice@acme.example", None, None).unwrap();
        let t = ticket(&f, "Printer down", "open", |n| n.requester_id = Some(alice)).await;

        let msg = message("RE: [Acme] printer   down", "ALICE@acme.example");
        let (found, reason) = f.classifier.find_reply_target(&msg).await.unwrap().unwrap();
        assert_eq!(found.id, t.id);
        assert_eq!(reason, MatchReason::Subject);

        let stranger = message("RE: printer down", "mallory@evil.example");
        assert_eq!(
            f.classifier.classify(&stranger).await.unwrap(),
            Classification::NewTicket
        );

        f.repo
            .add_watcher(t.id, &WatcherTarget::Email("mallory@evil.example".to_string()))
            .await
            .unwrap();
        assert!(matches!(
            f.classifier.classify(&stranger).await.unwrap(),
            Classification::Reply(_)
        ));
    }

    #[tokio::test]
    async fn test_short_subjects_never_fuzzy_match() {
        let f = fixture();
        let alice = f.directory.add_user("alice@acme.example", None, None).unwrap();
        ticket(&f, "Help", "open", |n| n.requester_id = Some(alice)).await;
        let msg = message("Re: help", "alice@acme.example");
        assert_eq!(
            f.classifier.classify(&msg).await.unwrap(),
            Classification::NewTicket
        );
    }

    #[tokio::test]
    async fn test_resolve_requester_order() {
        let f = fixture();
        let acme = f.directory.add_company("Acme", Some("acme.example")).unwrap();
        let alice = f
            .directory
            .add_user("alice@acme.example", None, Some(acme))
            .unwrap();
        f.directory
            .add_staff(acme, "carol@acme.example", Some(77))
            .unwrap();

        let r = f.classifier.resolve_requester("Alice@Acme.example", Some(9)).await.unwrap();
        assert_eq!(r, Requester { company_id: Some(acme), requester_id: Some(alice) });

        let r = f.classifier.resolve_requester("carol@acme.example", Some(9)).await.unwrap();
        assert_eq!(r, Requester { company_id: Some(acme), requester_id: Some(77) });

        let r = f.classifier.resolve_requester("dave@acme.example", Some(9)).await.unwrap();
        assert_eq!(r, Requester { company_id: Some(acme), requester_id: None });

        let r = f.classifier.resolve_requester("eve@other.example", Some(9)).await.unwrap();
        assert_eq!(r, Requester { company_id: Some(9), requester_id: None });
    }
}
