#[cfg(test)]
mod email_pipeline_tests {
    use deskserver::automation::{
        AutomationRouter, AutomationStore, MemoryAutomationStore, ModuleRegistry, NewAutomation,
        NewIntegrationModule,
    };
    use deskserver::core::config::WebhookSettings;
    use deskserver::core::restart::RestartGate;
    use deskserver::core::secrets::PasswordCipher;
    use deskserver::email::{
        ImapPoller, MailboxRecord, MailboxStore, MemoryMailboxConnector, MemoryMailboxStore,
        MemoryMessageLog, MessageLog,
    };
    use deskserver::template::TemplateEngine;
    use deskserver::tickets::models::NewTicket;
    use deskserver::tickets::{
        AllowlistSanitizer, AttachmentStore, MemoryContactDirectory, MemoryTicketRepository,
        MessageClassifier, StatusSet, TicketIngestor, TicketRepository, TicketService,
    };
    use deskserver::webhooks::{
        EventQuery, EventStatus, MemoryWebhookStore, WebhookDispatcher, WebhookStore,
    };
    use serde_json::json;
    use std::sync::Arc;

    struct Desk {
        poller: ImapPoller,
        mailbox: MemoryMailboxConnector,
        accounts: Arc<MemoryMailboxStore>,
        log: Arc<MemoryMessageLog>,
        repo: Arc<MemoryTicketRepository>,
        automations: Arc<MemoryAutomationStore>,
        webhooks: Arc<MemoryWebhookStore>,
        dispatcher: Arc<WebhookDispatcher>,
        cipher: PasswordCipher,
        _state: tempfile::TempDir,
    }

    fn desk() -> Desk {
        let state = tempfile::tempdir().unwrap();
        let webhooks = Arc::new(MemoryWebhookStore::new());
        let dispatcher =
            Arc::new(WebhookDispatcher::new(webhooks.clone(), WebhookSettings::default()).unwrap());
        let automations = Arc::new(MemoryAutomationStore::new());
        let router = Arc::new(AutomationRouter::new(
            automations.clone(),
            TemplateEngine::new(),
            ModuleRegistry::with_webhooks(Arc::clone(&dispatcher)),
        ));

        let repo = Arc::new(MemoryTicketRepository::new());
        let directory = Arc::new(MemoryContactDirectory::new());
        let sanitizer = Arc::new(AllowlistSanitizer::new());
        let service = Arc::new(TicketService::new(
            repo.clone(),
            directory.clone(),
            sanitizer.clone(),
            StatusSet::default(),
            router,
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
        let cipher = PasswordCipher::from_secret("integration secret").unwrap();
        let poller = ImapPoller::new(
            accounts.clone(),
            log.clone(),
            Arc::new(mailbox.clone()),
            directory,
            ingestor,
            cipher.clone(),
            RestartGate::new(state.path().join("restart_required")),
            512 * 1024,
        );

        Desk {
            poller,
            mailbox,
            accounts,
            log,
            repo,
            automations,
            webhooks,
            dispatcher,
            cipher,
            _state: state,
        }
    }

    async fn support_mailbox(desk: &Desk) -> i64 {
        desk.accounts
            .insert(MailboxRecord {
                name: "Support".to_string(),
                host: "imap.desk.example".to_string(),
                port: 993,
                username: "support@desk.example".to_string(),
                password_encrypted: desk.cipher.encrypt("s3cret").unwrap(),
                folder: "INBOX".to_string(),
                schedule: "*/5 * * * *".to_string(),
                process_unread_only: false,
                mark_as_read: false,
                sync_known_only: false,
                filter_rule: None,
                priority: 0,
                active: true,
                default_company_id: None,
                module_slug: "imap".to_string(),
            })
            .await
            .unwrap()
            .id
    }

    async fn bind_webhook(desk: &Desk, url: String) {
        desk.automations
            .upsert_module(NewIntegrationModule {
                slug: "webhook".to_string(),
                name: "Webhook".to_string(),
                enabled: true,
                settings: json!({ "url": url, "max_attempts": 3, "backoff_seconds": 60 }),
            })
            .await
            .unwrap();
        desk.automations
            .create_automation(NewAutomation::new(
                "Notify chat",
                "tickets.created",
                "webhook",
                json!({ "text": "New ticket: {{ticket.subject}}" }),
            ))
            .await
            .unwrap();
    }

    fn mail(headers: &str, body: &str) -> String {
        format!("To: support@desk.example\r\n{headers}\r\n\r\n{body}\r\n")
    }

    #[tokio::test]
    async fn test_new_mail_creates_ticket_and_delivers_webhook() {
        let mut server = mockito::Server::new_async().await;
        let hook = server
            .mock("POST", "/chat")
            .match_body(mockito::Matcher::Json(json!({ "text": "New ticket: Printer down" })))
            .with_status(200)
            .create_async()
            .await;

        let desk = desk();
        let account = support_mailbox(&desk).await;
        bind_webhook(&desk, format!("{}/chat", server.url())).await;
        desk.mailbox
            .deliver(
                1,
                mail(
                    "From: Alice <alice@acme.example>\r\nSubject: Printer down\r\nMessage-ID: <p1@acme.example>",
                    "The printer on floor 2 is jammed.",
                ),
            )
            .unwrap();

        let report = desk.poller.poll_account(account).await.unwrap();
        assert_eq!(report.imported, 1);

        let tickets = desk.repo.all_tickets().unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].subject, "Printer down");
        assert_eq!(tickets[0].status, "open");
        assert_eq!(tickets[0].priority, "normal");
        assert_eq!(tickets[0].external_reference.as_deref(), Some("<p1@acme.example>"));

        let queued = desk.webhooks.list_events(&EventQuery::default()).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].name, "tickets.created");

        let delivered = desk.dispatcher.attempt(queued[0].id).await.unwrap().unwrap();
        assert_eq!(delivered.status, EventStatus::Succeeded);
        hook.assert_async().await;
    }

    #[tokio::test]
    async fn test_reply_threads_onto_existing_ticket() {
        let desk = desk();
        let account = support_mailbox(&desk).await;
        let mut existing = NewTicket::new("Printer down", "open");
        existing.external_reference = Some("<m1@x>".to_string());
        let ticket = desk.repo.create_ticket(existing).await.unwrap();

        desk.mailbox
            .deliver(
                7,
                mail(
                    "From: alice@acme.example\r\nSubject: Re: Printer down\r\nMessage-ID: <m2@x>\r\nIn-Reply-To: <m1@x>",
                    "Still broken",
                ),
            )
            .unwrap();
        desk.poller.poll_account(account).await.unwrap();

        assert_eq!(desk.repo.all_tickets().unwrap().len(), 1);
        let replies = desk.repo.replies(ticket.id).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].body.contains("Still broken"));
        assert_eq!(desk.log.get(account, 7).await.unwrap().unwrap().ticket_id, Some(ticket.id));
    }

    #[tokio::test]
    async fn test_closed_ticket_number_opens_new_ticket() {
        let desk = desk();
        let account = support_mailbox(&desk).await;
        let mut closed = NewTicket::new("Old issue", "closed");
        closed.ticket_number = Some("42".to_string());
        let old = desk.repo.create_ticket(closed).await.unwrap();

        desk.mailbox
            .deliver(
                3,
                mail(
                    "From: alice@acme.example\r\nSubject: Re: issue #42\r\nMessage-ID: <q@x>",
                    "Happening again",
                ),
            )
            .unwrap();
        desk.poller.poll_account(account).await.unwrap();

        let tickets = desk.repo.all_tickets().unwrap();
        assert_eq!(tickets.len(), 2);
        assert!(desk.repo.replies(old.id).await.unwrap().is_empty());
        assert!(tickets.iter().any(|t| t.id != old.id && t.subject == "Re: issue #42"));
    }

    #[tokio::test]
    async fn test_second_poll_imports_nothing_new() {
        let desk = desk();
        let account = support_mailbox(&desk).await;
        bind_webhook(&desk, "https://hooks.desk.example/chat".to_string()).await;
        desk.mailbox
            .deliver(1, mail("From: bob@acme.example\r\nSubject: VPN\r\nMessage-ID: <v@x>", "Down"))
            .unwrap();

        desk.poller.poll_account(account).await.unwrap();
        let again = desk.poller.poll_account(account).await.unwrap();
        assert_eq!((again.found, again.imported, again.already_imported), (1, 0, 1));
        assert_eq!(desk.repo.all_tickets().unwrap().len(), 1);
        assert_eq!(desk.webhooks.list_events(&EventQuery::default()).await.unwrap().len(), 1);
    }
}
