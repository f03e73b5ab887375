use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use super::accounts::{MailboxAccount, MailboxStore};
use super::client::{ConnectParams, FetchedMessage, MailboxConnector, MailboxSession};
use super::match_context::match_context;
use super::mime::parse_message;
use super::records::{MessageLog, MessageStatus};
use crate::core::error::{CoreError, CoreResult};
use crate::core::restart::RestartGate;
use crate::core::secrets::PasswordCipher;
use crate::filter::FilterRule;
use crate::tasks::{TaskFuture, TaskHandler};
use crate::tickets::{ContactDirectory, MessageOrigin, TicketIngestor};

pub const PENDING_RESTART: &str = "pending_restart";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Completed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub account_id: i64,
    pub status: PollStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub found: usize,
    pub imported: usize,
    pub already_imported: usize,
    pub filtered: usize,
    pub errors: usize,
}

impl PollReport {
    fn completed(account_id: i64) -> Self {
        Self {
            account_id,
            status: PollStatus::Completed,
            reason: None,
            found: 0,
            imported: 0,
            already_imported: 0,
            filtered: 0,
            errors: 0,
        }
    }

    fn skipped(account_id: i64, reason: &str) -> Self {
        Self {
            status: PollStatus::Skipped,
            reason: Some(reason.to_string()),
            ..Self::completed(account_id)
        }
    }
}

enum UidOutcome {
    Imported(i64),
    Filtered(&'static str),
}

/// Fetches new mail for one mailbox and feeds it to the ticket ingestor.
pub struct ImapPoller {
    accounts: Arc<dyn MailboxStore>,
    log: Arc<dyn MessageLog>,
    connector: Arc<dyn MailboxConnector>,
    directory: Arc<dyn ContactDirectory>,
    ingestor: Arc<TicketIngestor>,
    cipher: PasswordCipher,
    gate: RestartGate,
    inline_limit: usize,
}

impl ImapPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Arc<dyn MailboxStore>,
        log: Arc<dyn MessageLog>,
        connector: Arc<dyn MailboxConnector>,
        directory: Arc<dyn ContactDirectory>,
        ingestor: Arc<TicketIngestor>,
        cipher: PasswordCipher,
        gate: RestartGate,
        inline_limit: usize,
    ) -> Self {
        Self {
            accounts,
            log,
            connector,
            directory,
            ingestor,
            cipher,
            gate,
            inline_limit,
        }
    }

    pub async fn poll_account(&self, account_id: i64) -> CoreResult<PollReport> {
        if self.gate.is_pending() {
            info!("Restart pending; skipping poll of mailbox {}", account_id);
            return Ok(PollReport::skipped(account_id, PENDING_RESTART));
        }

        let account = self
            .accounts
            .get(account_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("Mailbox {account_id}")))?;
        if !account.active {
            return Ok(PollReport::skipped(account_id, "inactive"));
        }
        let filter = account
            .filter_rule
            .as_deref()
            .map(FilterRule::parse)
            .transpose()?;

        let params = ConnectParams {
            host: account.host.clone(),
            port: u16::try_from(account.port)
                .map_err(|_| CoreError::validation(format!("Invalid port {}", account.port)))?,
            username: account.username.clone(),
            password: self.cipher.decrypt(&account.password_encrypted)?,
            folder: account.folder.clone(),
            read_only: !account.mark_as_read,
        };
        let mut session = self.connector.connect(&params).await?;

        let uids = match session.search(account.process_unread_only).await {
            Ok(uids) => uids,
            Err(e) => {
                if let Err(logout) = session.logout().await {
                    debug!("Logout after failed search: {}", logout);
                }
                return Err(e);
            }
        };

        let mut report = PollReport::completed(account.id);
        report.found = uids.len();
        for uid in uids {
            match self.log.get(account.id, uid).await {
                Ok(Some(record)) if record.is_imported() => {
                    report.already_imported += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Mailbox {} uid {}: record lookup failed: {}", account.id, uid, e);
                    report.errors += 1;
                    continue;
                }
            }

            match self.process_uid(&account, filter.as_ref(), session.as_mut(), uid).await {
                Ok(UidOutcome::Imported(ticket_id)) => {
                    report.imported += 1;
                    self.record(account.id, uid, MessageStatus::Imported, Some(ticket_id), None)
                        .await;
                    if account.mark_as_read {
                        if let Err(e) = session.mark_seen(uid).await {
                            warn!("Mailbox {} uid {}: failed to set \\Seen: {}", account.id, uid, e);
                        }
                    }
                }
                Ok(UidOutcome::Filtered(why)) => {
                    debug!("Mailbox {} uid {} skipped: {}", account.id, uid, why);
                    report.filtered += 1;
                }
                Err(e) => {
                    warn!("Mailbox {} uid {} failed: {}", account.id, uid, e);
                    report.errors += 1;
                    self.record(account.id, uid, MessageStatus::Error, None, Some(e.to_string()))
                        .await;
                }
            }
        }

        if let Err(e) = session.logout().await {
            warn!("Mailbox {}: logout failed: {}", account.id, e);
        }
        self.accounts.touch_synced(account.id, Utc::now()).await?;

        info!(
            "Mailbox {} polled: {} found, {} imported, {} filtered, {} errors",
            account.id, report.found, report.imported, report.filtered, report.errors
        );
        Ok(report)
    }

    async fn process_uid(
        &self,
        account: &MailboxAccount,
        filter: Option<&FilterRule>,
        session: &mut dyn MailboxSession,
        uid: u32,
    ) -> CoreResult<UidOutcome> {
        let FetchedMessage { raw, flags, .. } = session
            .fetch(uid)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("UID {uid} not on server")))?;
        let email = parse_message(&raw, self.inline_limit)?;

        if let Some(rule) = filter {
            if !rule.matches(&match_context(account, &email, &flags)) {
                return Ok(UidOutcome::Filtered("filter rule did not match"));
            }
        }

        if account.sync_known_only && !self.has_known_sender(&email.from.addresses).await? {
            return Ok(UidOutcome::Filtered("unknown sender"));
        }

        let origin = MessageOrigin {
            mailbox_username: account.username.clone(),
            module_slug: account.module_slug.clone(),
            default_company_id: account.default_company_id,
        };
        let outcome = self.ingestor.ingest(&email.into_inbound(), &origin).await?;
        Ok(UidOutcome::Imported(outcome.ticket_id()))
    }

    async fn has_known_sender(&self, addresses: &[String]) -> CoreResult<bool> {
        for address in addresses {
            if self.directory.is_known_sender(address).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn record(
        &self,
        account_id: i64,
        uid: u32,
        status: MessageStatus,
        ticket_id: Option<i64>,
        error: Option<String>,
    ) {
        if let Err(e) = self.log.record(account_id, uid, status, ticket_id, error).await {
            error!(
                "Mailbox {} uid {}: failed to record {} outcome: {}",
                account_id,
                uid,
                status.as_str(),
                e
            );
        }
    }

    /// Polls every active mailbox in `(priority, id)` order.
    pub async fn sync_all_active(&self) -> CoreResult<Vec<PollReport>> {
        if self.gate.is_pending() {
            info!("Restart pending; skipping mailbox sync");
            return Ok(Vec::new());
        }
        let mut reports = Vec::new();
        for account in self.accounts.list_active().await? {
            match self.poll_account(account.id).await {
                Ok(report) => reports.push(report),
                Err(e) => error!("Mailbox {} ({}) poll failed: {}", account.id, account.name, e),
            }
        }
        Ok(reports)
    }

    async fn run_task(&self, payload: Value) -> CoreResult<Value> {
        let account_id = payload
            .get("account_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| CoreError::validation("Task payload is missing account_id"))?;
        let report = self.poll_account(account_id).await?;
        Ok(serde_json::to_value(report)?)
    }

    /// Scheduler entry point; the payload carries `account_id`.
    pub fn task_handler(self: Arc<Self>) -> TaskHandler {
        Arc::new(move |payload: Value| {
            let poller = Arc::clone(&self);
            Box::pin(async move { poller.run_task(payload).await }) as TaskFuture
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::accounts::{MailboxRecord, MemoryMailboxStore};
    use crate::email::client::MemoryMailboxConnector;
    use crate::email::records::MemoryMessageLog;
    use crate::tickets::{
        AllowlistSanitizer, AttachmentStore, MemoryContactDirectory, MemoryTicketRepository,
        MessageClassifier, TicketRepository, TicketService,
    };
    use crate::tickets::events::NullEventSink;
    use crate::tickets::status::StatusSet;
    use serde_json::json;

    struct Fixture {
        poller: ImapPoller,
        accounts: Arc<MemoryMailboxStore>,
        log: Arc<MemoryMessageLog>,
        mailbox: MemoryMailboxConnector,
        directory: Arc<MemoryContactDirectory>,
        repo: Arc<MemoryTicketRepository>,
        cipher: PasswordCipher,
        state: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let state = tempfile::tempdir().unwrap();
        let repo = Arc::new(MemoryTicketRepository::new());
        let directory = Arc::new(MemoryContactDirectory::new());
        let sanitizer = Arc::new(AllowlistSanitizer::new());
        let service = Arc::new(TicketService::new(
            repo.clone(),
            directory.clone(),
            sanitizer.clone(),
            StatusSet::default(),
            Arc::new(NullEventSink),
        ));
        let ingestor = Arc::new(TicketIngestor::new(
            service,
            MessageClassifier::new(repo.clone(), directory.clone(), 20),
            sanitizer,
            AttachmentStore::new(state.path().join("uploads")),
        ));
        let accounts = Arc::new(MemoryMailboxStore::new());
        let log = Arc::new(MemoryMessageLog::new());
        let mailbox = MemoryMailboxConnector::new();
        let cipher = PasswordCipher::from_secret("test passphrase").unwrap();
        let poller = ImapPoller::new(
            accounts.clone(),
            log.clone(),
            Arc::new(mailbox.clone()),
            directory.clone(),
            ingestor,
            cipher.clone(),
            RestartGate::new(state.path().join("restart_required")),
            1024 * 1024,
        );
        Fixture {
            poller,
            accounts,
            log,
            mailbox,
            directory,
            repo,
            cipher,
            state,
        }
    }

    async fn add_account(f: &Fixture, edit: impl FnOnce(&mut MailboxRecord)) -> i64 {
        let mut record = MailboxRecord {
            name: "Support".to_string(),
            host: "imap.desk.example".to_string(),
            port: 993,
            username: "support@desk.example".to_string(),
            password_encrypted: f.cipher.encrypt("hunter2").unwrap(),
            folder: "INBOX".to_string(),
            schedule: "*/15 * * * *".to_string(),
            process_unread_only: false,
            mark_as_read: false,
            sync_known_only: false,
            filter_rule: None,
            priority: 0,
            active: true,
            default_company_id: None,
            module_slug: "imap".to_string(),
        };
        edit(&mut record);
        f.accounts.insert(record).await.unwrap().id
    }

    fn mail(from: &str, subject: &str, message_id: &str) -> String {
        format!(
            "From: {from}\r\nTo: support@desk.example\r\nSubject: {subject}\r\nMessage-ID: {message_id}\r\n\r\nHello there\r\n"
        )
    }

    #[tokio::test]
    async fn test_poll_imports_once() {
        let f = fixture();
        let id = add_account(&f, |_| {}).await;
        f.mailbox.deliver(1, mail("alice@acme.example", "Printer down", "<a1@acme>")).unwrap();
        f.mailbox.deliver(2, mail("bob@acme.example", "VPN broken", "<b1@acme>")).unwrap();

        let report = f.poller.poll_account(id).await.unwrap();
        assert_eq!((report.found, report.imported, report.errors), (2, 2, 0));
        assert_eq!(f.repo.all_tickets().unwrap().len(), 2);

        let params = f.mailbox.last_connection().unwrap().unwrap();
        assert_eq!(params.password, "hunter2");
        assert!(params.read_only);
        assert!(f.mailbox.flags(1).unwrap().is_empty());

        let again = f.poller.poll_account(id).await.unwrap();
        assert_eq!((again.imported, again.already_imported), (0, 2));
        assert_eq!(f.repo.all_tickets().unwrap().len(), 2);
        assert!(f.accounts.get(id).await.unwrap().unwrap().last_synced_at.is_some());
        assert_eq!(f.mailbox.logout_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_uid_does_not_block_others_and_is_retried() {
        let f = fixture();
        let id = add_account(&f, |_| {}).await;
        f.mailbox.deliver(1, mail("alice@acme.example", "First", "<1@x>")).unwrap();
        f.mailbox.deliver(2, mail("alice@acme.example", "Second", "<2@x>")).unwrap();
        f.mailbox.break_uid(1, true).unwrap();

        let report = f.poller.poll_account(id).await.unwrap();
        assert_eq!((report.imported, report.errors), (1, 1));
        let failed = f.log.get(id, 1).await.unwrap().unwrap();
        assert_eq!(failed.status, "error");
        assert!(failed.error.unwrap().contains("FETCH 1 failed"));

        f.mailbox.break_uid(1, false).unwrap();
        let retry = f.poller.poll_account(id).await.unwrap();
        assert_eq!((retry.imported, retry.already_imported), (1, 1));
        assert!(f.log.get(id, 1).await.unwrap().unwrap().is_imported());
    }

    #[tokio::test]
    async fn test_mark_as_read_sets_seen_after_import() {
        let f = fixture();
        let id = add_account(&f, |r| {
            r.mark_as_read = true;
            r.process_unread_only = true;
        })
        .await;
        f.mailbox.deliver(9, mail("alice@acme.example", "Printer down", "<p@x>")).unwrap();

        f.poller.poll_account(id).await.unwrap();
        assert!(!f.mailbox.last_connection().unwrap().unwrap().read_only);
        assert_eq!(f.mailbox.flags(9).unwrap(), vec!["\\Seen".to_string()]);

        let again = f.poller.poll_account(id).await.unwrap();
        assert_eq!(again.found, 0);
    }

    #[tokio::test]
    async fn test_filter_rule_and_known_senders() {
        let f = fixture();
        f.directory.add_user("alice@acme.example", Some("Alice"), None).unwrap();
        let rule = FilterRule::from_value(&json!({
            "field": "subject", "operator": "not_contains", "value": "newsletter"
        }))
        .unwrap();
        let id = add_account(&f, |r| {
            r.sync_known_only = true;
            r.filter_rule = Some(rule.to_canonical_json());
        })
        .await;
        f.mailbox.deliver(1, mail("alice@acme.example", "Weekly newsletter", "<n@x>")).unwrap();
        f.mailbox.deliver(2, mail("mallory@evil.example", "Invoice", "<i@x>")).unwrap();
        f.mailbox.deliver(3, mail("Alice@Acme.example", "Printer down", "<p@x>")).unwrap();

        let report = f.poller.poll_account(id).await.unwrap();
        assert_eq!((report.imported, report.filtered), (1, 2));
        let tickets = f.repo.all_tickets().unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].subject, "Printer down");
        assert!(f.log.get(id, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_restart_skips_without_connecting() {
        let f = fixture();
        let id = add_account(&f, |_| {}).await;
        std::fs::write(f.state.path().join("restart_required"), b"").unwrap();

        let report = f.poller.poll_account(id).await.unwrap();
        assert_eq!(report.status, PollStatus::Skipped);
        assert_eq!(
            serde_json::to_value(&report).unwrap()["reason"],
            json!(PENDING_RESTART)
        );
        assert_eq!(f.mailbox.connection_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sync_all_active_orders_by_priority() {
        let f = fixture();
        let low = add_account(&f, |r| r.priority = 5).await;
        let high = add_account(&f, |r| r.priority = 1).await;
        add_account(&f, |r| r.active = false).await;

        let reports = f.poller.sync_all_active().await.unwrap();
        let order: Vec<i64> = reports.iter().map(|r| r.account_id).collect();
        assert_eq!(order, vec![high, low]);
    }

    #[tokio::test]
    async fn test_task_handler_reports_poll() {
        let f = fixture();
        let id = add_account(&f, |_| {}).await;
        f.mailbox.deliver(1, mail("alice@acme.example", "Printer down", "<a@x>")).unwrap();
        let poller = Arc::new(f.poller);
        let handler = Arc::clone(&poller).task_handler();

        let outcome = handler(json!({ "account_id": id })).await.unwrap();
        assert_eq!(outcome["status"], "completed");
        assert_eq!(outcome["imported"], 1);
        assert!(handler(json!({})).await.is_err());
        assert_eq!(f.repo.all_tickets().unwrap().len(), 1);
        let ticket = f.repo.all_tickets().unwrap().remove(0);
        assert_eq!(
            f.repo.get_ticket(ticket.id).await.unwrap().unwrap().external_reference.as_deref(),
            Some("<a@x>")
        );
    }
}
