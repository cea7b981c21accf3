//! Persistent memory (spec §4.G): small, durable facts/preferences/
//! learnings the agent accumulates across sessions, distinct from the
//! rolling conversation summaries the archive owns. Each entry is embedded
//! at write time so it can surface through hybrid search later.

use std::sync::Arc;

use chrono::Utc;
use fern_embeddings::EmbeddingsClient;
use fern_storage::{MemoryRow, Store};
use ulid::Ulid;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("storage error: {0}")]
    Storage(#[from] fern_storage::StorageError),
    #[error("embedding error: {0}")]
    Embedding(#[from] fern_embeddings::EmbeddingError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Fact,
    Preference,
    Learning,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Fact => "fact",
            MemoryType::Preference => "preference",
            MemoryType::Learning => "learning",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "preference" => MemoryType::Preference,
            "learning" => MemoryType::Learning,
            _ => MemoryType::Fact,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Memory {
    pub id: String,
    pub memory_type: MemoryType,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<MemoryRow> for Memory {
    fn from(row: MemoryRow) -> Self {
        Memory {
            id: row.id,
            memory_type: MemoryType::parse(&row.memory_type),
            content: row.content,
            tags: row.tags,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub struct MemoryStore {
    store: Store,
    embeddings: Arc<dyn EmbeddingsClient>,
}

impl MemoryStore {
    pub fn new(store: Store, embeddings: Arc<dyn EmbeddingsClient>) -> Self {
        Self { store, embeddings }
    }

    /// Inserts a new memory. The row, its FTS shadow, and its embedding are
    /// written together; if embedding fails the memory is still saved
    /// (an empty vector is a legal fallback, per the embeddings contract),
    /// just without a vector search hit later.
    pub async fn add(
        &self,
        memory_type: MemoryType,
        content: &str,
        tags: Vec<String>,
    ) -> Result<Memory, MemoryError> {
        let now = Utc::now().to_rfc3339();
        let id = Ulid::new().to_string();

        let embedding = match self.embeddings.embed(content).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(error = %err, "embedding failed for new memory, saving without a vector");
                None
            }
        };

        let row = MemoryRow {
            id: id.clone(),
            memory_type: memory_type.as_str().to_string(),
            content: content.to_string(),
            tags,
            created_at: now.clone(),
            updated_at: now,
        };
        self.store.insert_memory(row.clone(), embedding).await?;
        Ok(row.into())
    }

    pub async fn list(&self, memory_type: Option<MemoryType>, limit: usize) -> Result<Vec<Memory>, MemoryError> {
        let rows = self
            .store
            .list_memories(memory_type.map(|t| t.as_str().to_string()), limit)
            .await?;
        Ok(rows.into_iter().map(Memory::from).collect())
    }

    /// Removes a memory from all three backing tables (spec §4.G): the row
    /// itself, its vector, and its FTS shadow (cleaned up by the storage
    /// layer's delete trigger). Returns `false` if no such memory exists.
    pub async fn delete(&self, id: &str) -> Result<bool, MemoryError> {
        Ok(self.store.delete_memory(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fern_embeddings::StubEmbeddingsClient;

    async fn store_with_memory() -> (MemoryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let embeddings = Arc::new(StubEmbeddingsClient::new(8));
        (MemoryStore::new(store, embeddings), dir)
    }

    #[tokio::test]
    async fn add_then_list_round_trips() {
        let (mem, _dir) = store_with_memory().await;
        mem.add(MemoryType::Fact, "the user prefers dark mode", vec!["ui".into()])
            .await
            .unwrap();

        let all = mem.list(None, 10).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].memory_type, MemoryType::Fact);
        assert_eq!(all[0].tags, vec!["ui".to_string()]);
    }

    #[tokio::test]
    async fn list_filters_by_type() {
        let (mem, _dir) = store_with_memory().await;
        mem.add(MemoryType::Fact, "fact one", vec![]).await.unwrap();
        mem.add(MemoryType::Preference, "prefers concise replies", vec![])
            .await
            .unwrap();

        let prefs = mem.list(Some(MemoryType::Preference), 10).await.unwrap();
        assert_eq!(prefs.len(), 1);
        assert_eq!(prefs[0].content, "prefers concise replies");
    }

    #[tokio::test]
    async fn list_respects_limit() {
        let (mem, _dir) = store_with_memory().await;
        for i in 0..5 {
            mem.add(MemoryType::Learning, &format!("learning {i}"), vec![])
                .await
                .unwrap();
        }
        let limited = mem.list(None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_the_memory() {
        let (mem, _dir) = store_with_memory().await;
        let saved = mem.add(MemoryType::Fact, "to be forgotten", vec![]).await.unwrap();

        let removed = mem.delete(&saved.id).await.unwrap();
        assert!(removed);
        assert!(mem.list(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_of_unknown_id_returns_false() {
        let (mem, _dir) = store_with_memory().await;
        let removed = mem.delete("does-not-exist").await.unwrap();
        assert!(!removed);
    }
}
