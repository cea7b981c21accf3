use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Per-thread archival cursor. Persisted as a JSON file rather than a DB
/// row: it is read and rewritten on every archival pass for one thread,
/// and keeping it on disk means a corrupt watermark can't take the shared
/// database down with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveWatermark {
    pub last_archived_index: i64,
    pub last_archived_message_id: Option<String>,
    pub total_archived_tokens: i64,
    pub total_chunks: i64,
    pub last_archived_at: Option<String>,
    pub session_id: String,
}

impl ArchiveWatermark {
    pub fn fresh(session_id: &str) -> Self {
        Self {
            last_archived_index: -1,
            last_archived_message_id: None,
            total_archived_tokens: 0,
            total_chunks: 0,
            last_archived_at: None,
            session_id: session_id.to_string(),
        }
    }

    pub fn start_index(&self) -> usize {
        (self.last_archived_index + 1).max(0) as usize
    }
}

fn watermark_path(root: &Path, thread_id: &str) -> PathBuf {
    root.join("chunks").join(thread_id).join("watermark.json")
}

pub async fn load(root: &Path, thread_id: &str) -> Option<ArchiveWatermark> {
    let path = watermark_path(root, thread_id);
    let raw = tokio::fs::read_to_string(&path).await.ok()?;
    serde_json::from_str(&raw).ok()
}

pub async fn save(root: &Path, thread_id: &str, watermark: &ArchiveWatermark) -> std::io::Result<()> {
    let path = watermark_path(root, thread_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(watermark).unwrap_or_default();
    tokio::fs::write(path, json).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_writes_under_a_chunks_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), "thread-1", &ArchiveWatermark::fresh("s1")).await.unwrap();
        assert!(dir.path().join("chunks").join("thread-1").join("watermark.json").exists());
        assert!(load(dir.path(), "thread-1").await.is_some());
    }
}
