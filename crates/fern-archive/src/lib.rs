//! Conversation archival (spec §4.E): watermark-driven chunking,
//! summarisation, embedding, and indexing of conversation history. Runs
//! fire-and-forget after every agent turn; a per-thread lock ensures at
//! most one archival pass is in flight for a given thread at a time.

mod chunk;
mod watermark;

pub use chunk::{ChunkFile, ChunkPlan};
pub use watermark::ArchiveWatermark;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use fern_embeddings::EmbeddingsClient;
use fern_llm::LlmClient;
use fern_storage::{Store, SummaryRow};
use futures::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use ulid::Ulid;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("storage error: {0}")]
    Storage(#[from] fern_storage::StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("llm error: {0}")]
    Llm(#[from] fern_llm::LlmError),
}

#[derive(Debug, Clone, Copy)]
pub struct ArchiveConfig {
    pub chunk_threshold: usize,
    pub chunk_min: usize,
    pub chunk_max: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: 25_000,
            chunk_min: 15_000,
            chunk_max: 40_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived { chunk_id: String },
    AwaitingMore,
    NothingNew,
}

const SUMMARY_FALLBACK: &str = "[Summary unavailable]";

pub struct ArchivalObserver {
    store: Store,
    embeddings: Arc<dyn EmbeddingsClient>,
    llm: Arc<dyn LlmClient>,
    root: PathBuf,
    config: ArchiveConfig,
    locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ArchivalObserver {
    pub fn new(
        store: Store,
        embeddings: Arc<dyn EmbeddingsClient>,
        llm: Arc<dyn LlmClient>,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self::with_config(store, embeddings, llm, root, ArchiveConfig::default())
    }

    pub fn with_config(
        store: Store,
        embeddings: Arc<dyn EmbeddingsClient>,
        llm: Arc<dyn LlmClient>,
        root: impl Into<PathBuf>,
        config: ArchiveConfig,
    ) -> Self {
        Self {
            store,
            embeddings,
            llm,
            root: root.into(),
            config,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Runs one archival pass for `thread_id`/`session_id`. Safe to call
    /// after every turn: most calls will find the unarchived suffix below
    /// `chunk_threshold` and return `NothingNew` immediately.
    pub async fn archive_after_turn(&self, thread_id: &str, session_id: &str) -> Result<ArchiveOutcome, ArchiveError> {
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;

        let messages = self.llm.list_messages(session_id).await?;

        let watermark = match watermark::load(&self.root, thread_id).await {
            Some(w) if w.session_id == session_id => w,
            Some(_) => {
                tracing::warn!(thread_id, "watermark session mismatch, resetting to index 0 (session rollover)");
                ArchiveWatermark::fresh(session_id)
            }
            None => ArchiveWatermark::fresh(session_id),
        };

        let start = watermark.start_index();
        if start >= messages.len() {
            return Ok(ArchiveOutcome::NothingNew);
        }
        let suffix = &messages[start..];

        let suffix_tokens = fern_tokenizer::estimate_messages(suffix);
        if suffix_tokens < self.config.chunk_threshold {
            return Ok(ArchiveOutcome::NothingNew);
        }

        let plan = chunk::plan_chunk(suffix, self.config.chunk_max);
        if plan.len == 0 {
            return Ok(ArchiveOutcome::NothingNew);
        }
        let more_remaining = plan.len < suffix.len();
        if plan.token_count < self.config.chunk_min && more_remaining {
            return Ok(ArchiveOutcome::AwaitingMore);
        }

        let chosen = &suffix[..plan.len];
        let chunk_id = format!("chunk_{}", Ulid::new());
        let now = Utc::now().to_rfc3339();

        let summary = self.summarise(chosen).await;

        let chunk_file = chunk::ChunkFile {
            chunk_id: chunk_id.clone(),
            thread_id: thread_id.to_string(),
            session_id: session_id.to_string(),
            messages: chosen.to_vec(),
            token_count: plan.token_count,
            message_count: chosen.len(),
            created_at: now.clone(),
        };
        chunk::persist(&self.root, &chunk_file).await?;

        let embedding = match self.embeddings.embed(&summary).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(error = %err, "failed to embed chunk summary, indexing without a vector");
                None
            }
        };

        let first = &chosen[0];
        let last = &chosen[chosen.len() - 1];
        self.store
            .insert_summary(
                SummaryRow {
                    chunk_id: chunk_id.clone(),
                    thread_id: thread_id.to_string(),
                    session_id: session_id.to_string(),
                    summary,
                    token_count: plan.token_count as i64,
                    message_count: chosen.len() as i64,
                    first_message_id: first.id.clone(),
                    last_message_id: last.id.clone(),
                    first_ts: first.time.to_rfc3339(),
                    last_ts: last.time.to_rfc3339(),
                    created_at: now.clone(),
                },
                embedding,
            )
            .await?;

        let new_watermark = ArchiveWatermark {
            last_archived_index: (start + plan.len - 1) as i64,
            last_archived_message_id: Some(last.id.clone()),
            total_archived_tokens: watermark.total_archived_tokens + plan.token_count as i64,
            total_chunks: watermark.total_chunks + 1,
            last_archived_at: Some(now),
            session_id: session_id.to_string(),
        };
        watermark::save(&self.root, thread_id, &new_watermark).await?;

        Ok(ArchiveOutcome::Archived { chunk_id })
    }

    /// Current archival cursor for a thread, if any archival has run yet.
    /// Exposed for dashboard reads; not used by `archive_after_turn`
    /// itself, which loads its own copy under the per-thread lock.
    pub async fn watermark_for(&self, thread_id: &str) -> Option<ArchiveWatermark> {
        watermark::load(&self.root, thread_id).await
    }

    async fn summarise(&self, messages: &[fern_types::Message]) -> String {
        let transcript: String = messages
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.text()))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!("Summarise this conversation excerpt in a few sentences:\n{transcript}");

        let result = async {
            let session = self.llm.create_session(Some("archival-summary")).await?;
            let mut stream = self.llm.send_prompt(&session.session_id, &prompt).await?;
            let mut text = String::new();
            while let Some(event) = stream.next().await {
                if let fern_types::AgentEvent::Text { delta } = event {
                    text.push_str(&delta);
                }
            }
            Ok::<String, fern_llm::LlmError>(text)
        }
        .await;

        match result {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => SUMMARY_FALLBACK.to_string(),
            Err(err) => {
                tracing::warn!(error = %err, "summarisation failed, using fallback placeholder");
                SUMMARY_FALLBACK.to_string()
            }
        }
    }
}
