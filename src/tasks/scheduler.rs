use chrono::{DateTime, Utc};
use cron::Schedule;
use log::{debug, error, info, trace, warn};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

use super::schedule::{next_run_after, parse_cron};
use super::store::{ScheduledTask, ScheduledTaskStore};
use crate::core::error::{CoreError, CoreResult};
use crate::webhooks::WebhookDispatcher;

pub type TaskFuture = Pin<Box<dyn Future<Output = CoreResult<Value>> + Send>>;

/// Runs one task with its stored payload.
pub type TaskHandler = Arc<dyn Fn(Value) -> TaskFuture + Send + Sync>;

struct ScheduleEntry {
    task: ScheduledTask,
    schedule: Schedule,
    next_run: Option<DateTime<Utc>>,
}

/// Asks a running scheduler to reload its task definitions.
#[derive(Clone, Default)]
pub struct RefreshHandle {
    notify: Arc<Notify>,
}

impl RefreshHandle {
    pub fn request(&self) {
        self.notify.notify_one();
    }
}

/// Cron-driven runner over `scheduled_tasks` rows, keyed by task id.
///
/// A task whose previous run is still going is skipped for that tick.
#[derive(Clone)]
pub struct TaskScheduler {
    store: Arc<dyn ScheduledTaskStore>,
    task_registry: Arc<RwLock<HashMap<String, TaskHandler>>>,
    entries: Arc<RwLock<HashMap<i64, ScheduleEntry>>>,
    running_tasks: Arc<Mutex<HashSet<i64>>>,
    refresh: RefreshHandle,
    shutdown: CancellationToken,
    tick: Duration,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn ScheduledTaskStore>) -> Self {
        Self {
            store,
            task_registry: Arc::new(RwLock::new(HashMap::new())),
            entries: Arc::new(RwLock::new(HashMap::new())),
            running_tasks: Arc::new(Mutex::new(HashSet::new())),
            refresh: RefreshHandle::default(),
            shutdown: CancellationToken::new(),
            tick: Duration::from_secs(15),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn refresh_handle(&self) -> RefreshHandle {
        self.refresh.clone()
    }

    pub async fn register_handler(&self, task_type: impl Into<String>, handler: TaskHandler) {
        let mut registry = self.task_registry.write().await;
        registry.insert(task_type.into(), handler);
    }

    /// Reloads enabled tasks; unchanged schedules keep their next run time.
    pub async fn refresh(&self) -> CoreResult<usize> {
        let tasks = self.store.list_enabled().await?;
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let mut fresh = HashMap::with_capacity(tasks.len());

        for task in tasks {
            let schedule = match parse_cron(&task.cron_expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!("Skipping scheduled task {} ({}): {}", task.id, task.name, e);
                    continue;
                }
            };
            let next_run = match entries.get(&task.id) {
                Some(existing) if existing.task.cron_expression == task.cron_expression => {
                    existing.next_run
                }
                _ => next_run_after(&schedule, now),
            };
            fresh.insert(
                task.id,
                ScheduleEntry {
                    task,
                    schedule,
                    next_run,
                },
            );
        }

        let count = fresh.len();
        *entries = fresh;
        info!("Loaded {} scheduled task(s)", count);
        Ok(count)
    }

    pub async fn next_run(&self, task_id: i64) -> Option<DateTime<Utc>> {
        self.entries
            .read()
            .await
            .get(&task_id)
            .and_then(|e| e.next_run)
    }

    pub fn is_running(&self, task_id: i64) -> bool {
        self.running_tasks
            .lock()
            .map(|running| running.contains(&task_id))
            .unwrap_or(false)
    }

    /// Starts every task due at `now`; returns how many were launched.
    pub async fn run_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<ScheduledTask> = {
            let mut entries = self.entries.write().await;
            entries
                .values_mut()
                .filter(|e| e.next_run.is_some_and(|next| next <= now))
                .map(|e| {
                    e.next_run = next_run_after(&e.schedule, now);
                    e.task.clone()
                })
                .collect()
        };

        let mut launched = 0;
        for task in due {
            if !self.claim(task.id) {
                debug!(
                    "Scheduled task {} ({}) still running; skipping this tick",
                    task.id, task.name
                );
                continue;
            }
            self.execute_task(task).await;
            launched += 1;
        }
        launched
    }

    /// Runs `task_id` now regardless of its schedule.
    pub async fn run_now(&self, task_id: i64) -> CoreResult<bool> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("Scheduled task {task_id}")))?;
        if !self.claim(task.id) {
            return Ok(false);
        }
        self.execute_task(task).await;
        Ok(true)
    }

    fn claim(&self, task_id: i64) -> bool {
        match self.running_tasks.lock() {
            Ok(mut running) => running.insert(task_id),
            Err(_) => false,
        }
    }

    async fn execute_task(&self, task: ScheduledTask) {
        let handler = self.task_registry.read().await.get(&task.task_type).cloned();
        let store = Arc::clone(&self.store);
        let running_tasks = Arc::clone(&self.running_tasks);

        tokio::spawn(async move {
            let started_at = Utc::now();
            let result = match handler {
                Some(handler) => handler(task.payload.clone()).await,
                None => Err(CoreError::internal(format!(
                    "No handler for task type: {}",
                    task.task_type
                ))),
            };

            match result {
                Ok(outcome) => debug!("Task {} ({}) finished: {}", task.id, task.name, outcome),
                Err(e) => error!("Task {} ({}) failed: {}", task.id, task.name, e),
            }
            if let Err(e) = store.mark_run(task.id, started_at).await {
                warn!("Failed to record run of task {}: {}", task.id, e);
            }
            if let Ok(mut running) = running_tasks.lock() {
                running.remove(&task.id);
            }
        });
    }

    /// Ticks until shutdown, reloading whenever a refresh is requested.
    pub async fn start(self) {
        if let Err(e) = self.refresh().await {
            error!("Failed to load scheduled tasks: {}", e);
        }
        info!("Task scheduler started");

        let mut ticker = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.refresh.notify.notified() => {
                    if let Err(e) = self.refresh().await {
                        error!("Failed to reload scheduled tasks: {}", e);
                    }
                }
                _ = ticker.tick() => {
                    let launched = self.run_due(Utc::now()).await;
                    trace!("Scheduler tick launched {} task(s)", launched);
                }
            }
        }
        info!("Task scheduler stopped");
    }
}

/// Periodic webhook timeout and retention sweeps.
pub async fn run_webhook_sweeps(
    dispatcher: Arc<WebhookDispatcher>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = dispatcher.sweep_timeouts().await {
            error!("Webhook timeout sweep failed: {}", e);
        }
        if let Err(e) = dispatcher.purge_succeeded().await {
            error!("Webhook retention sweep failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::store::{MemoryScheduledTaskStore, NewScheduledTask};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn scheduler_with(cron: &str) -> (TaskScheduler, i64) {
        let store = Arc::new(MemoryScheduledTaskStore::new());
        let task = store
            .create(NewScheduledTask {
                name: "Poll support inbox".to_string(),
                task_type: "imap_poll".to_string(),
                cron_expression: cron.to_string(),
                payload: json!({ "account_id": 1 }),
                enabled: true,
            })
            .await
            .unwrap();
        (TaskScheduler::new(store), task.id)
    }

    #[tokio::test]
    async fn test_due_task_runs_with_payload() {
        let (scheduler, task_id) = scheduler_with("* * * * *").await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        scheduler
            .register_handler(
                "imap_poll",
                Arc::new(move |payload: Value| {
                    let sink = Arc::clone(&sink);
                    Box::pin(async move {
                        sink.lock().unwrap().push(payload);
                        Ok(json!({ "status": "completed" }))
                    }) as TaskFuture
                }),
            )
            .await;
        assert_eq!(scheduler.refresh().await.unwrap(), 1);

        let next = scheduler.next_run(task_id).await.unwrap();
        assert_eq!(scheduler.run_due(next - chrono::Duration::seconds(1)).await, 0);
        assert_eq!(scheduler.run_due(next).await, 1);
        assert!(scheduler.next_run(task_id).await.unwrap() > next);

        for _ in 0..50 {
            if !scheduler.is_running(task_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.lock().unwrap().as_slice(), &[json!({ "account_id": 1 })]);
    }

    #[tokio::test]
    async fn test_overlapping_runs_are_skipped() {
        let (scheduler, task_id) = scheduler_with("* * * * *").await;
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (gate, counter) = (Arc::clone(&release), Arc::clone(&calls));
        scheduler
            .register_handler(
                "imap_poll",
                Arc::new(move |_payload: Value| {
                    let (gate, counter) = (Arc::clone(&gate), Arc::clone(&counter));
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(Value::Null)
                    }) as TaskFuture
                }),
            )
            .await;
        scheduler.refresh().await.unwrap();

        assert!(scheduler.run_now(task_id).await.unwrap());
        assert!(!scheduler.run_now(task_id).await.unwrap());
        let far = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(scheduler.run_due(far).await, 0);

        release.notify_one();
        for _ in 0..50 {
            if !scheduler.is_running(task_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!scheduler.is_running(task_id));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_drops_invalid_and_disabled_tasks() {
        let store = Arc::new(MemoryScheduledTaskStore::new());
        for (cron, enabled) in [("*/5 * * * *", true), ("bogus", true), ("* * * * *", false)] {
            store
                .create(NewScheduledTask {
                    name: cron.to_string(),
                    task_type: "imap_poll".to_string(),
                    cron_expression: cron.to_string(),
                    payload: Value::Null,
                    enabled,
                })
                .await
                .unwrap();
        }
        let scheduler = TaskScheduler::new(store);
        assert_eq!(scheduler.refresh().await.unwrap(), 1);
    }
}
