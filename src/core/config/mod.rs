use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::tickets::status::StatusDefinition;

pub const CONFIG_FILE: &str = "deskserver.toml";
pub const ENV_PREFIX: &str = "DESK_";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub webhooks: WebhookSettings,
    pub imap: ImapSettings,
    pub uploads: UploadsConfig,
    pub statuses: Vec<StatusDefinition>,
    pub secrets: SecretsConfig,
    pub tickets: TicketSettings,
    pub templates: TemplateSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Overrides `DATABASE_URL` when set.
    pub url: Option<String>,
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub workers: usize,
    pub batch_size: i64,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub stall_timeout_secs: i64,
    pub retention_hours: i64,
    pub sweep_interval_secs: u64,
    pub max_backoff_secs: i64,
    /// Treat 4xx (other than 408/429) as terminal on the first failure.
    pub fail_fast_on_client_error: bool,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            batch_size: 50,
            poll_interval_secs: 5,
            request_timeout_secs: 10,
            stall_timeout_secs: 600,
            retention_hours: 24,
            sweep_interval_secs: 60,
            max_backoff_secs: 3600,
            fail_fast_on_client_error: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapSettings {
    pub default_schedule: String,
    pub restart_flag_path: PathBuf,
    pub inline_image_limit_bytes: usize,
    pub default_folder: String,
}

impl Default for ImapSettings {
    fn default() -> Self {
        Self {
            default_schedule: "*/15 * * * *".to_string(),
            restart_flag_path: PathBuf::from("./deskserver-stack/state/restart_required"),
            inline_image_limit_bytes: 5 * 1024 * 1024,
            default_folder: "INBOX".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadsConfig {
    pub root: PathBuf,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./deskserver-stack/uploads"),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Base64 encoded 32-byte key, or any passphrase (hashed with SHA-256).
    pub mailbox_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketSettings {
    pub merge_chain_depth: usize,
    pub fuzzy_candidates: i64,
}

impl Default for TicketSettings {
    fn default() -> Self {
        Self {
            merge_chain_depth: 10,
            fuzzy_candidates: 20,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateSettings {
    pub max_depth: usize,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self { max_depth: 5 }
    }
}

impl AppConfig {
    /// Defaults, then `deskserver.toml`, then `DESK_*` variables (`__` separates sections).
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment(CONFIG_FILE).extract()
    }

    pub fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn database_url(&self) -> Option<String> {
        self.database
            .url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.webhooks.request_timeout_secs, 10);
        assert_eq!(config.webhooks.stall_timeout_secs, 600);
        assert_eq!(config.webhooks.retention_hours, 24);
        assert_eq!(config.imap.default_schedule, "*/15 * * * *");
        assert_eq!(config.imap.inline_image_limit_bytes, 5 * 1024 * 1024);
        assert!(config.statuses.is_empty());
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[webhooks]\nworkers = 4\n\n[[statuses]]\ntech_status = \"new\"\ntech_label = \"New\"\npublic_status = \"Open\""
        )
        .unwrap();
        let config: AppConfig = AppConfig::figment(file.path().to_str().unwrap())
            .extract()
            .unwrap();
        assert_eq!(config.webhooks.workers, 4);
        assert_eq!(config.webhooks.batch_size, 50);
        assert_eq!(config.statuses.len(), 1);
        assert_eq!(config.statuses[0].tech_status, "new");
    }
}
