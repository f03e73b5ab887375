use anyhow::Context;
use dotenvy::dotenv;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use deskserver::automation::{AutomationRouter, ModuleRegistry, PgAutomationStore};
use deskserver::core::config::AppConfig;
use deskserver::core::restart::RestartGate;
use deskserver::core::secrets::PasswordCipher;
use deskserver::core::shared::{create_conn, run_migrations};
use deskserver::email::{ImapPoller, MailboxConnector, PgMailboxStore, PgMessageLog};
use deskserver::tasks::{run_webhook_sweeps, PgScheduledTaskStore, TaskScheduler, IMAP_POLL_TASK};
use deskserver::template::{PgDynamicQuerySource, PgTemplateSource, TemplateEngine};
use deskserver::tickets::{
    AllowlistSanitizer, AttachmentStore, MessageClassifier, PgContactDirectory, PgTicketRepository,
    StatusSet, TicketIngestor, TicketService,
};
use deskserver::webhooks::{PgWebhookStore, WebhookDispatcher};

const USAGE: &str = "Usage: deskserver [serve|migrate|sync]

  serve    run the scheduler and webhook dispatcher until Ctrl-C (default)
  migrate  apply database migrations and exit
  sync     poll every active mailbox once and exit";

#[cfg(feature = "mail")]
fn mailbox_connector() -> Arc<dyn MailboxConnector> {
    Arc::new(deskserver::email::ImapConnector::new())
}

#[cfg(not(feature = "mail"))]
fn mailbox_connector() -> Arc<dyn MailboxConnector> {
    log::warn!("Built without the mail feature; mailboxes will appear empty");
    Arc::new(deskserver::email::MemoryMailboxConnector::new())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("serve");
    match command {
        "serve" | "migrate" | "sync" => {}
        "--help" | "-h" => {
            println!("{USAGE}");
            return Ok(());
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            anyhow::bail!("unknown command {other}");
        }
    }

    let config = AppConfig::load().context("Failed to load configuration")?;
    let pool = create_conn(&config).context("Failed to create database pool")?;
    run_migrations(&pool).context("Failed to run migrations")?;
    if command == "migrate" {
        info!("Migrations applied");
        return Ok(());
    }

    let shutdown = CancellationToken::new();

    let dispatcher = Arc::new(
        WebhookDispatcher::new(Arc::new(PgWebhookStore::new(pool.clone())), config.webhooks.clone())?
            .with_shutdown(shutdown.clone()),
    );

    let engine = TemplateEngine::new()
        .with_templates(Arc::new(PgTemplateSource::new(pool.clone())))
        .with_dynamic_queries(Arc::new(PgDynamicQuerySource::new(pool.clone())))
        .with_max_depth(config.templates.max_depth);
    let router = Arc::new(AutomationRouter::new(
        Arc::new(PgAutomationStore::new(pool.clone())),
        engine,
        ModuleRegistry::with_webhooks(Arc::clone(&dispatcher)),
    ));

    let repo = Arc::new(PgTicketRepository::new(pool.clone()));
    let directory = Arc::new(PgContactDirectory::new(pool.clone()));
    let sanitizer = Arc::new(AllowlistSanitizer::new());
    let service = Arc::new(
        TicketService::new(
            repo.clone(),
            directory.clone(),
            sanitizer.clone(),
            StatusSet::from_config(&config.statuses),
            router,
        )
        .with_merge_chain_depth(config.tickets.merge_chain_depth),
    );
    let ingestor = Arc::new(TicketIngestor::new(
        service,
        MessageClassifier::new(repo, directory.clone(), config.tickets.fuzzy_candidates),
        sanitizer,
        AttachmentStore::new(config.uploads.root.clone()),
    ));

    let cipher = PasswordCipher::from_secret(&config.secrets.mailbox_key)
        .context("secrets.mailbox_key must be set to decrypt mailbox passwords")?;
    let poller = Arc::new(ImapPoller::new(
        Arc::new(PgMailboxStore::new(pool.clone())),
        Arc::new(PgMessageLog::new(pool.clone())),
        mailbox_connector(),
        directory,
        ingestor,
        cipher,
        RestartGate::new(config.imap.restart_flag_path.clone()),
        config.imap.inline_image_limit_bytes,
    ));

    if command == "sync" {
        for report in poller.sync_all_active().await? {
            info!(
                "Mailbox {}: {:?}, {} imported, {} errors",
                report.account_id, report.status, report.imported, report.errors
            );
        }
        return Ok(());
    }

    let scheduler = TaskScheduler::new(Arc::new(PgScheduledTaskStore::new(pool.clone())))
        .with_shutdown(shutdown.clone());
    scheduler
        .register_handler(IMAP_POLL_TASK, Arc::clone(&poller).task_handler())
        .await;

    let handles = vec![
        tokio::spawn(scheduler.start()),
        tokio::spawn(Arc::clone(&dispatcher).run()),
        tokio::spawn(run_webhook_sweeps(
            dispatcher,
            Duration::from_secs(config.webhooks.sweep_interval_secs.max(1)),
            shutdown.clone(),
        )),
    ];
    info!("deskserver running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Background task ended abnormally: {}", e);
        }
    }
    Ok(())
}
