//! Durable job scheduler (spec §4.H): a pending queue polled on an
//! interval, atomic claim so multiple pollers never double-execute a job,
//! and cron advance for recurring jobs.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use fern_llm::LlmClient;
use fern_storage::{JobRow, Store};
use fern_watchdog::Watchdog;
use tokio::sync::Semaphore;
use ulid::Ulid;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] fern_storage::StorageError),
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    OneShot,
    Recurring,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    pub max_concurrent_jobs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 60_000,
            max_concurrent_jobs: 3,
        }
    }
}

pub struct JobScheduler {
    store: Store,
    llm: Arc<dyn LlmClient>,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    watchdog: Option<Arc<Watchdog>>,
}

impl JobScheduler {
    pub fn new(store: Store, llm: Arc<dyn LlmClient>) -> Self {
        Self::with_config(store, llm, SchedulerConfig::default())
    }

    pub fn with_config(store: Store, llm: Arc<dyn LlmClient>, config: SchedulerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Self { store, llm, config, semaphore, watchdog: None }
    }

    /// Reports tick failures to `watchdog` (spec §4.J crash-loop guard),
    /// so repeated poll failures trip the same shutdown path an unhealthy
    /// LLM provider does.
    pub fn with_watchdog(mut self, watchdog: Arc<Watchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn schedule_one_shot(prompt: impl Into<String>, scheduled_at: chrono::DateTime<Utc>) -> JobRow {
        let now = Utc::now().to_rfc3339();
        JobRow {
            id: Ulid::new().to_string(),
            job_type: "one_shot".to_string(),
            status: "pending".to_string(),
            prompt: prompt.into(),
            scheduled_at: scheduled_at.to_rfc3339(),
            cron_expr: None,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
            last_run_response: None,
            last_error: None,
            metadata: "{}".to_string(),
        }
    }

    pub fn schedule_recurring(prompt: impl Into<String>, cron_expr: impl Into<String>, first_fire: chrono::DateTime<Utc>, metadata: serde_json::Value) -> JobRow {
        let now = Utc::now().to_rfc3339();
        JobRow {
            id: Ulid::new().to_string(),
            job_type: "recurring".to_string(),
            status: "pending".to_string(),
            prompt: prompt.into(),
            scheduled_at: first_fire.to_rfc3339(),
            cron_expr: Some(cron_expr.into()),
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
            last_run_response: None,
            last_error: None,
            metadata: metadata.to_string(),
        }
    }

    /// All rows left `running` from a previous process are reset to
    /// `pending` so they execute again; called once at startup.
    pub async fn recover_stale_jobs(&self) -> Result<usize, SchedulerError> {
        let stuck = self.store.list_jobs(Some("running".to_string())).await?;
        let now = Utc::now().to_rfc3339();
        for mut job in stuck.iter().cloned() {
            job.status = "pending".to_string();
            job.updated_at = now.clone();
            self.store.update_job(job).await?;
        }
        Ok(stuck.len())
    }

    /// Runs the poll loop until `shutdown` fires.
    pub async fn run_forever(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(self.config.poll_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        tracing::error!(error = %err, "scheduler tick failed");
                        if let Some(watchdog) = &self.watchdog {
                            watchdog.record_scheduler_failure();
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// Claims and executes every due job, bounded by `max_concurrent_jobs`.
    pub async fn tick(&self) -> Result<usize, SchedulerError> {
        let now = Utc::now().to_rfc3339();
        let mut executed = 0usize;
        let mut handles = Vec::new();

        loop {
            let Some(job) = self.store.claim_due_job(&now).await? else { break };
            let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let store = self.store.clone();
            let llm = self.llm.clone();
            executed += 1;
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                execute_job(&store, llm.as_ref(), job).await
            }));
        }

        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "job execution task panicked");
            }
        }

        Ok(executed)
    }
}

async fn execute_job(store: &Store, llm: &dyn LlmClient, job: JobRow) {
    let session_name = format!("job_{}", job.id);
    let outcome = async {
        let session = llm.create_session(Some(&session_name)).await?;
        fern_llm::run_prompt_to_completion(llm, &session.session_id, &job.prompt).await
    }
    .await;

    let now = Utc::now().to_rfc3339();
    let mut updated = job.clone();
    updated.updated_at = now.clone();

    match outcome {
        Ok(response) => {
            if job.job_type == "recurring" {
                match next_fire(&job, &now) {
                    Ok(next) => {
                        updated.status = "pending".to_string();
                        updated.scheduled_at = next;
                        updated.last_error = None;
                        updated.last_run_response = Some(response);
                    }
                    Err(err) => {
                        updated.status = "failed".to_string();
                        updated.last_error = Some(err.to_string());
                    }
                }
            } else {
                updated.status = "completed".to_string();
                updated.completed_at = Some(now);
                updated.last_run_response = Some(response);
            }
        }
        Err(err) => {
            updated.status = "failed".to_string();
            updated.last_error = Some(err.to_string());
        }
    }

    if let Err(err) = store.update_job(updated).await {
        tracing::error!(error = %err, job_id = %job.id, "failed to persist job completion");
    }
}

/// The `cron` crate requires a seconds-first 6- or 7-field expression;
/// standard 5-field cron (minute-first, no seconds) is prefixed with a
/// `0` seconds field so either form can be stored in `cron_expr`.
fn normalize_cron_expr(expr: &str) -> String {
    match expr.split_whitespace().count() {
        5 => format!("0 {expr}"),
        _ => expr.to_string(),
    }
}

fn next_fire(job: &JobRow, now_iso: &str) -> Result<String, SchedulerError> {
    let expr = job
        .cron_expr
        .as_deref()
        .ok_or_else(|| SchedulerError::InvalidCron("recurring job missing cron_expr".to_string()))?;
    let schedule = Schedule::from_str(&normalize_cron_expr(expr)).map_err(|e| SchedulerError::InvalidCron(e.to_string()))?;

    let tz_name = serde_json::from_str::<serde_json::Value>(&job.metadata)
        .ok()
        .and_then(|v| v.get("timezone").and_then(|t| t.as_str().map(str::to_string)));

    let now = chrono::DateTime::parse_from_rfc3339(now_iso)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    let next = if let Some(tz_name) = tz_name {
        let tz: chrono_tz::Tz = tz_name
            .parse()
            .map_err(|_| SchedulerError::InvalidCron(format!("unknown timezone {tz_name}")))?;
        schedule.after(&now.with_timezone(&tz)).next().map(|d| d.with_timezone(&Utc))
    } else {
        schedule.after(&now).next()
    };

    next.map(|d| d.to_rfc3339())
        .ok_or_else(|| SchedulerError::InvalidCron("cron expression has no future occurrence".to_string()))
}
