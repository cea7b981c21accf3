//! Sub-agent executor (spec §4.I): a bounded worker pool over one-shot
//! tasks, with atomic claim-by-id, cancel-aware completion, and waiters
//! that resolve synchronously if a task is already terminal.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use fern_llm::LlmClient;
use fern_storage::{Store, TaskRow};
use tokio::sync::{oneshot, Semaphore};
use ulid::Ulid;

#[derive(Debug, thiserror::Error)]
pub enum SubagentError {
    #[error("storage error: {0}")]
    Storage(#[from] fern_storage::StorageError),
    #[error("no such task: {0}")]
    NotFound(String),
    #[error("executor is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Explore,
    Research,
    General,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Explore => "explore",
            AgentType::Research => "research",
            AgentType::General => "general",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubagentConfig {
    pub max_concurrent_tasks: usize,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self { max_concurrent_tasks: 3 }
    }
}

#[derive(Clone)]
enum WaitSignal {
    Ready(TaskRow),
    NotFound(String),
    ShuttingDown,
}

impl From<WaitSignal> for Result<TaskRow, SubagentError> {
    fn from(signal: WaitSignal) -> Self {
        match signal {
            WaitSignal::Ready(row) => Ok(row),
            WaitSignal::NotFound(id) => Err(SubagentError::NotFound(id)),
            WaitSignal::ShuttingDown => Err(SubagentError::ShuttingDown),
        }
    }
}

struct Waiters {
    by_task: HashMap<String, Vec<oneshot::Sender<WaitSignal>>>,
    shutting_down: bool,
}

pub struct SubagentExecutor {
    store: Store,
    llm: Arc<dyn LlmClient>,
    semaphore: Arc<Semaphore>,
    waiters: std::sync::Mutex<Waiters>,
}

impl SubagentExecutor {
    pub fn new(store: Store, llm: Arc<dyn LlmClient>) -> Self {
        Self::with_config(store, llm, SubagentConfig::default())
    }

    pub fn with_config(store: Store, llm: Arc<dyn LlmClient>, config: SubagentConfig) -> Self {
        Self {
            store,
            llm,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            waiters: std::sync::Mutex::new(Waiters {
                by_task: HashMap::new(),
                shutting_down: false,
            }),
        }
    }

    /// Inserts a new pending task row and returns its id. Does not start
    /// execution; call `spawn_task` to claim and run it.
    pub async fn enqueue(
        &self,
        agent_type: AgentType,
        prompt: impl Into<String>,
        parent_session_id: impl Into<String>,
    ) -> Result<String, SubagentError> {
        let id = Ulid::new().to_string();
        let now = Utc::now().to_rfc3339();
        self.store
            .insert_task(TaskRow {
                id: id.clone(),
                agent_type: agent_type.as_str().to_string(),
                status: "pending".to_string(),
                prompt: prompt.into(),
                parent_session_id: parent_session_id.into(),
                created_at: now.clone(),
                updated_at: now,
                completed_at: None,
                result: None,
                error: None,
            })
            .await?;
        Ok(id)
    }

    /// Atomically claims `id` (pending -> running) and spawns its
    /// execution in the background. If the claim fails (already claimed,
    /// cancelled, or unknown) any registered waiters are notified
    /// immediately with the task's current state.
    pub async fn spawn_task(self: &Arc<Self>, id: &str) -> Result<(), SubagentError> {
        let now = Utc::now().to_rfc3339();
        match self.store.claim_task_by_id(id, &now).await? {
            Some(task) => {
                let this = self.clone();
                let id = task.id.clone();
                tokio::spawn(async move {
                    let permit = this.semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                    this.run(task).await;
                    drop(permit);
                    this.notify_waiters(&id).await;
                });
                Ok(())
            }
            None => {
                self.notify_waiters(id).await;
                Ok(())
            }
        }
    }

    async fn run(&self, task: TaskRow) {
        let session_name = format!("subagent_{}", task.id);
        let outcome = async {
            let session = self.llm.create_session(Some(&session_name)).await?;
            fern_llm::run_prompt_to_completion(self.llm.as_ref(), &session.session_id, &task.prompt).await
        }
        .await;

        let now = Utc::now().to_rfc3339();
        let (status, result, error) = match outcome {
            Ok(text) => ("completed", Some(text), None),
            Err(err) => ("failed", None, Some(err.to_string())),
        };

        match self.store.finish_task_if_running(&task.id, status, result, error, &now).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(task_id = %task.id, "task was cancelled while running, skipping terminal write");
            }
            Err(err) => {
                tracing::error!(error = %err, task_id = %task.id, "failed to persist task completion");
            }
        }
    }

    /// Resolves when `id` reaches a terminal status: synchronously if it
    /// is already terminal, otherwise by registering a completion waiter.
    pub async fn wait_for_task(&self, id: &str) -> Result<TaskRow, SubagentError> {
        if let Some(task) = self.store.get_task(id).await? {
            if is_terminal(&task.status) {
                return Ok(task);
            }
        } else {
            return Err(SubagentError::NotFound(id.to_string()));
        }

        let rx = {
            let mut waiters = self.waiters.lock().unwrap();
            if waiters.shutting_down {
                return Err(SubagentError::ShuttingDown);
            }
            let (tx, rx) = oneshot::channel();
            waiters.by_task.entry(id.to_string()).or_default().push(tx);
            rx
        };

        rx.await.unwrap_or(WaitSignal::ShuttingDown).into()
    }

    async fn notify_waiters(&self, id: &str) {
        let senders = {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.by_task.remove(id).unwrap_or_default()
        };
        if senders.is_empty() {
            return;
        }
        let signal = match self.store.get_task(id).await {
            Ok(Some(row)) => WaitSignal::Ready(row),
            Ok(None) => WaitSignal::NotFound(id.to_string()),
            Err(err) => WaitSignal::NotFound(err.to_string()),
        };
        for tx in senders {
            let _ = tx.send(signal.clone());
        }
    }

    /// Cancels a pending or running task by moving it straight to
    /// `cancelled`. A running task's executor will observe the status
    /// mismatch on its terminal write and skip clobbering it. A task still
    /// queued behind the worker pool is claimed directly out of `pending`,
    /// since it will never reach the `running` guard on its own.
    pub async fn cancel(&self, id: &str) -> Result<bool, SubagentError> {
        let now = Utc::now().to_rfc3339();
        let cancelled = self.store.finish_task_if_running(id, "cancelled", None, None, &now).await?
            || self.store.cancel_pending_task(id, &now).await?;
        if cancelled {
            self.notify_waiters(id).await;
        }
        Ok(cancelled)
    }

    /// On boot: any row left `running` from a previous process is a
    /// one-shot task that cannot be resumed, so it is marked `failed`
    /// rather than retried.
    pub async fn recover_stale_tasks(&self) -> Result<usize, SubagentError> {
        let now = Utc::now().to_rfc3339();
        // Any row still `running` at boot was last updated strictly before
        // `now`, so using the current time as the cutoff recovers every
        // stuck row unconditionally, per spec: there is no staleness
        // window for this recovery, unlike the scheduler's jobs.
        let stuck = self.store.list_stale_running_tasks(&now).await?;
        for task in &stuck {
            self.store
                .finish_task_if_running(
                    &task.id,
                    "failed",
                    None,
                    Some("Process restarted during execution".to_string()),
                    &now,
                )
                .await?;
        }
        Ok(stuck.len())
    }

    /// Deletes terminal-state rows older than `ttl`; default retention is
    /// 7 days.
    pub async fn cleanup_expired(&self, ttl: chrono::Duration) -> Result<usize, SubagentError> {
        let cutoff = (Utc::now() - ttl).to_rfc3339();
        Ok(self.store.delete_tasks_completed_before(&cutoff).await?)
    }

    /// Rejects every currently registered waiter with a shutting-down
    /// error; subsequent `wait_for_task` calls fail fast instead of
    /// hanging.
    pub fn shutdown(&self) {
        let mut waiters = self.waiters.lock().unwrap();
        waiters.shutting_down = true;
        for (_, senders) in waiters.by_task.drain() {
            for tx in senders {
                let _ = tx.send(WaitSignal::ShuttingDown);
            }
        }
    }
}

fn is_terminal(status: &str) -> bool {
    matches!(status, "completed" | "failed" | "cancelled")
}
