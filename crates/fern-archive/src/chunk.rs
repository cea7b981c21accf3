use std::path::{Path, PathBuf};

use fern_types::Message;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct ChunkPlan {
    /// Indices into the suffix slice (not the full message list) chosen
    /// for this chunk.
    pub len: usize,
    pub token_count: usize,
}

/// Greedily selects a contiguous run of messages bounded by `chunk_max`.
/// A single message exceeding `chunk_max` on its own is still admitted
/// when it is the first in the chunk, so an outsized turn doesn't stall
/// the watermark forever; any later message of that size is deferred to
/// the next pass instead.
pub fn plan_chunk(messages: &[Message], chunk_max: usize) -> ChunkPlan {
    let mut total = 0usize;
    let mut len = 0usize;

    for msg in messages {
        let tokens = fern_tokenizer::estimate(msg);
        if len == 0 {
            total += tokens;
            len = 1;
            continue;
        }
        if total + tokens > chunk_max {
            break;
        }
        total += tokens;
        len += 1;
    }

    ChunkPlan { len, token_count: total }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkFile {
    pub chunk_id: String,
    pub thread_id: String,
    pub session_id: String,
    pub messages: Vec<Message>,
    pub token_count: usize,
    pub message_count: usize,
    pub created_at: String,
}

fn chunk_path(root: &Path, thread_id: &str, chunk_id: &str) -> PathBuf {
    root.join("chunks").join(thread_id).join(format!("{chunk_id}.json"))
}

pub async fn persist(root: &Path, chunk: &ChunkFile) -> std::io::Result<()> {
    let path = chunk_path(root, &chunk.thread_id, &chunk.chunk_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(chunk).unwrap_or_default();
    tokio::fs::write(path, json).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fern_types::{Part, Role};

    fn msg(text: &str) -> Message {
        Message {
            id: format!("m-{text}"),
            session_id: "s1".into(),
            role: Role::User,
            time: Utc::now(),
            parts: vec![Part::Text { text: text.into() }],
            tokens: None,
        }
    }

    #[test]
    fn stops_before_exceeding_chunk_max() {
        // Each message is 8 bytes -> 2 tokens. chunk_max = 5 tokens admits 2 messages (4 tokens),
        // a third would bring it to 6 > 5.
        let messages = vec![msg("12345678"), msg("12345678"), msg("12345678")];
        let plan = plan_chunk(&messages, 5);
        assert_eq!(plan.len, 2);
        assert_eq!(plan.token_count, 4);
    }

    #[test]
    fn admits_oversized_first_message_alone() {
        let huge = msg(&"x".repeat(400)); // 400 bytes -> 100 tokens
        let messages = vec![huge, msg("1234")];
        let plan = plan_chunk(&messages, 10);
        assert_eq!(plan.len, 1);
        assert_eq!(plan.token_count, 100);
    }

    #[test]
    fn empty_input_yields_empty_plan() {
        let plan = plan_chunk(&[], 1000);
        assert_eq!(plan.len, 0);
        assert_eq!(plan.token_count, 0);
    }

    #[tokio::test]
    async fn persist_writes_under_a_chunks_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = ChunkFile {
            chunk_id: "c1".to_string(),
            thread_id: "thread-1".to_string(),
            session_id: "s1".to_string(),
            messages: vec![],
            token_count: 0,
            message_count: 0,
            created_at: Utc::now().to_rfc3339(),
        };
        persist(dir.path(), &chunk).await.unwrap();
        assert!(dir.path().join("chunks").join("thread-1").join("c1.json").exists());
    }
}
