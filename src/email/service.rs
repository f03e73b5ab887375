use log::{info, warn};
use serde_json::{json, Value};
use std::sync::Arc;

use super::accounts::{MailboxAccount, MailboxInput, MailboxRecord, MailboxStore, IMAPS_PORT};
use crate::core::config::ImapSettings;
use crate::core::error::{CoreError, CoreResult};
use crate::core::secrets::PasswordCipher;
use crate::filter::{canonicalize, FilterRule};
use crate::tasks::{normalize_cron, NewScheduledTask, RefreshHandle, ScheduledTaskStore, IMAP_POLL_TASK};

pub const DEFAULT_MODULE_SLUG: &str = "imap";

/// Mailbox CRUD that keeps each account's scheduled poll task in step.
pub struct MailboxService {
    store: Arc<dyn MailboxStore>,
    tasks: Arc<dyn ScheduledTaskStore>,
    cipher: PasswordCipher,
    refresh: RefreshHandle,
    settings: ImapSettings,
}

impl MailboxService {
    pub fn new(
        store: Arc<dyn MailboxStore>,
        tasks: Arc<dyn ScheduledTaskStore>,
        cipher: PasswordCipher,
        refresh: RefreshHandle,
        settings: ImapSettings,
    ) -> Self {
        Self {
            store,
            tasks,
            cipher,
            refresh,
            settings,
        }
    }

    pub async fn get(&self, id: i64) -> CoreResult<MailboxAccount> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("Mailbox {id}")))
    }

    pub async fn create(&self, input: MailboxInput) -> CoreResult<MailboxAccount> {
        let password = input
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CoreError::validation("Password is required"))?;
        let encrypted = self.cipher.encrypt(password)?;
        let record = self.validate(&input, encrypted)?;

        let account = self.store.insert(record).await?;
        let task = self.tasks.create(poll_task(&account)).await?;
        self.store.set_scheduled_task(account.id, Some(task.id)).await?;
        self.refresh.request();

        info!("Created mailbox {} ({}) with poll task {}", account.id, account.name, task.id);
        self.get(account.id).await
    }

    /// A missing or empty password keeps the stored one.
    pub async fn update(&self, id: i64, input: MailboxInput) -> CoreResult<MailboxAccount> {
        let existing = self.get(id).await?;
        let encrypted = match input.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => self.cipher.encrypt(password)?,
            None => existing.password_encrypted.clone(),
        };
        let record = self.validate(&input, encrypted)?;
        let account = self.store.update(id, record).await?;

        let task_id = match existing.scheduled_task_id {
            Some(task_id) => match self.tasks.update(task_id, poll_task(&account)).await {
                Ok(task) => task.id,
                Err(CoreError::NotFound(_)) => {
                    warn!("Poll task {} of mailbox {} vanished; recreating", task_id, id);
                    self.tasks.create(poll_task(&account)).await?.id
                }
                Err(e) => return Err(e),
            },
            None => self.tasks.create(poll_task(&account)).await?.id,
        };
        if existing.scheduled_task_id != Some(task_id) {
            self.store.set_scheduled_task(id, Some(task_id)).await?;
        }
        self.refresh.request();

        info!("Updated mailbox {} ({})", id, account.name);
        self.get(id).await
    }

    pub async fn delete(&self, id: i64) -> CoreResult<()> {
        let existing = self.get(id).await?;
        if let Some(task_id) = existing.scheduled_task_id {
            self.tasks.delete(task_id).await?;
        }
        self.store.delete(id).await?;
        self.refresh.request();
        info!("Deleted mailbox {} ({})", id, existing.name);
        Ok(())
    }

    fn validate(&self, input: &MailboxInput, password_encrypted: String) -> CoreResult<MailboxRecord> {
        let host = input.host.trim();
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(CoreError::validation("Host is required and must not contain spaces"));
        }
        let username = input.username.trim();
        if username.is_empty() {
            return Err(CoreError::validation("Username is required"));
        }

        let port = input.port.unwrap_or(IMAPS_PORT);
        if !(1..=65535).contains(&port) {
            return Err(CoreError::validation(format!("Port {port} is out of range")));
        }

        let folder = input
            .folder
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .unwrap_or(&self.settings.default_folder)
            .to_string();
        if folder.contains(['\r', '\n', '"']) {
            return Err(CoreError::validation(format!("Invalid folder name {folder:?}")));
        }

        let schedule = normalize_cron(
            input
                .schedule
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(&self.settings.default_schedule),
        )?;

        let module_slug = input
            .module_slug
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_MODULE_SLUG)
            .to_lowercase();
        if !module_slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(CoreError::validation(format!("Invalid module slug '{module_slug}'")));
        }

        let name = match input.name.trim() {
            "" => username.to_string(),
            name => name.to_string(),
        };

        Ok(MailboxRecord {
            name,
            host: host.to_string(),
            port,
            username: username.to_string(),
            password_encrypted,
            folder,
            schedule,
            process_unread_only: input.process_unread_only,
            mark_as_read: input.mark_as_read,
            sync_known_only: input.sync_known_only,
            filter_rule: canonical_filter(input.filter_rule.as_ref())?,
            priority: input.priority,
            active: input.active.unwrap_or(true),
            default_company_id: input.default_company_id,
            module_slug,
        })
    }
}

/// Canonical JSON for a submitted rule; blank input clears it.
fn canonical_filter(rule: Option<&Value>) -> CoreResult<Option<String>> {
    match rule {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(Value::String(text)) => Ok(Some(canonicalize(text)?)),
        Some(value @ Value::Object(_)) => Ok(Some(FilterRule::from_value(value)?.to_canonical_json())),
        Some(_) => Err(CoreError::validation("Filter rule must be a JSON object")),
    }
}

fn poll_task(account: &MailboxAccount) -> NewScheduledTask {
    NewScheduledTask {
        name: format!("IMAP poll: {}", account.name),
        task_type: IMAP_POLL_TASK.to_string(),
        cron_expression: account.schedule.clone(),
        payload: json!({ "account_id": account.id }),
        enabled: account.active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::accounts::MemoryMailboxStore;
    use crate::tasks::MemoryScheduledTaskStore;

    struct Fixture {
        service: MailboxService,
        tasks: Arc<MemoryScheduledTaskStore>,
        cipher: PasswordCipher,
    }

    fn fixture() -> Fixture {
        let tasks = Arc::new(MemoryScheduledTaskStore::new());
        let cipher = PasswordCipher::from_secret("mailbox secret").unwrap();
        let service = MailboxService::new(
            Arc::new(MemoryMailboxStore::new()),
            tasks.clone(),
            cipher.clone(),
            RefreshHandle::default(),
            ImapSettings::default(),
        );
        Fixture {
            service,
            tasks,
            cipher,
        }
    }

    fn input() -> MailboxInput {
        MailboxInput {
            host: "imap.desk.example".to_string(),
            username: "support@desk.example".to_string(),
            password: Some("hunter2".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_applies_defaults_and_owns_task() {
        let f = fixture();
        let account = f.service.create(input()).await.unwrap();

        assert_eq!(account.port, 993);
        assert_eq!(account.folder, "INBOX");
        assert_eq!(account.schedule, "*/15 * * * *");
        assert_eq!(account.name, "support@desk.example");
        assert_eq!(account.module_slug, "imap");
        assert_ne!(account.password_encrypted, "hunter2");
        assert_eq!(f.cipher.decrypt(&account.password_encrypted).unwrap(), "hunter2");

        let task = f.tasks.get(account.scheduled_task_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(task.task_type, IMAP_POLL_TASK);
        assert_eq!(task.payload, json!({ "account_id": account.id }));
        assert_eq!(task.cron_expression, "*/15 * * * *");
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let f = fixture();
        let cases = [
            MailboxInput { host: String::new(), ..input() },
            MailboxInput { port: Some(70000), ..input() },
            MailboxInput { schedule: Some("every minute".to_string()), ..input() },
            MailboxInput { filter_rule: Some(json!({ "field": "subject" })), ..input() },
            MailboxInput { password: None, ..input() },
        ];
        for case in cases {
            let err = f.service.create(case).await.unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)), "{err}");
        }
    }

    #[tokio::test]
    async fn test_filter_is_stored_canonically() {
        let f = fixture();
        let account = f
            .service
            .create(MailboxInput {
                filter_rule: Some(Value::String(
                    r#"{"any":[{"operator":"contains","value":"urgent","field":"subject"}]}"#.to_string(),
                )),
                ..input()
            })
            .await
            .unwrap();
        assert_eq!(
            account.filter_rule.as_deref(),
            Some(r#"{"any":[{"contains":"urgent","field":"subject"}]}"#)
        );
    }

    #[tokio::test]
    async fn test_update_keeps_password_and_moves_schedule() {
        let f = fixture();
        let created = f.service.create(input()).await.unwrap();
        let updated = f
            .service
            .update(
                created.id,
                MailboxInput {
                    password: None,
                    schedule: Some("0  9 * * 1-5".to_string()),
                    active: Some(false),
                    ..input()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.password_encrypted, created.password_encrypted);
        assert_eq!(updated.scheduled_task_id, created.scheduled_task_id);
        let task = f.tasks.get(updated.scheduled_task_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(task.cron_expression, "0 9 * * 1-5");
        assert!(!task.enabled);
    }

    #[tokio::test]
    async fn test_delete_removes_task() {
        let f = fixture();
        let created = f.service.create(input()).await.unwrap();
        let task_id = created.scheduled_task_id.unwrap();
        f.service.delete(created.id).await.unwrap();

        assert!(f.tasks.get(task_id).await.unwrap().is_none());
        assert!(matches!(
            f.service.get(created.id).await,
            Err(CoreError::NotFound(_))
        ));
    }
}
