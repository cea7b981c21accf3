//! One-time migration of legacy JSONL summary logs into the SQL store.
//! Embedding is delegated to the caller (the binary wires the real
//! embeddings client in; tests can pass a stub) so this crate stays free
//! of a dependency on `fern-embeddings`.

use std::future::Future;
use std::path::Path;

use serde::Deserialize;

use crate::{StorageError, Store, SummaryRow};

#[derive(Debug, Deserialize)]
struct LegacyLine {
    thread_id: String,
    session_id: String,
    summary: String,
    #[serde(default)]
    token_count: i64,
    #[serde(default)]
    message_count: i64,
    #[serde(default)]
    first_message_id: Option<String>,
    #[serde(default)]
    last_message_id: Option<String>,
    #[serde(default)]
    first_ts: Option<String>,
    #[serde(default)]
    last_ts: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct LegacyMigrationReport {
    pub migrated: usize,
    pub skipped_malformed: usize,
}

/// Reads `path` line by line, embeds each summary's text in one batch call,
/// inserts the rows, then deletes the file. A missing file is treated as
/// "nothing to migrate" rather than an error, since this runs on every
/// startup until the legacy log is gone.
pub async fn migrate_legacy_jsonl<F, Fut>(
    store: &Store,
    path: &Path,
    embed_batch: F,
) -> Result<LegacyMigrationReport, StorageError>
where
    F: FnOnce(Vec<String>) -> Fut,
    Fut: Future<Output = Result<Vec<Vec<f32>>, StorageError>>,
{
    let Ok(raw) = tokio::fs::read_to_string(path).await else {
        return Ok(LegacyMigrationReport::default());
    };

    let mut report = LegacyMigrationReport::default();
    let mut parsed = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LegacyLine>(line) {
            Ok(entry) => parsed.push(entry),
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed legacy summary line");
                report.skipped_malformed += 1;
            }
        }
    }

    if parsed.is_empty() {
        tokio::fs::remove_file(path).await?;
        return Ok(report);
    }

    let texts: Vec<String> = parsed.iter().map(|p| p.summary.clone()).collect();
    let embeddings = embed_batch(texts).await?;

    for (idx, (entry, embedding)) in parsed.into_iter().zip(embeddings.into_iter()).enumerate() {
        let now = entry.created_at.clone().unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string());
        let row = SummaryRow {
            chunk_id: format!("{}-legacy-{idx:06}", entry.thread_id),
            thread_id: entry.thread_id,
            session_id: entry.session_id,
            summary: entry.summary,
            token_count: entry.token_count,
            message_count: entry.message_count,
            first_message_id: entry.first_message_id.unwrap_or_default(),
            last_message_id: entry.last_message_id.unwrap_or_default(),
            first_ts: entry.first_ts.unwrap_or_else(|| now.clone()),
            last_ts: entry.last_ts.unwrap_or_else(|| now.clone()),
            created_at: now,
        };
        let embedding = if embedding.is_empty() { None } else { Some(embedding) };
        store.insert_summary(row, embedding).await?;
        report.migrated += 1;
    }

    tokio::fs::remove_file(path).await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrates_valid_lines_and_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let legacy_path = dir.path().join("legacy.jsonl");
        tokio::fs::write(
            &legacy_path,
            r#"{"thread_id":"t1","session_id":"s1","summary":"hello world","token_count":5,"message_count":2}
not json
{"thread_id":"t1","session_id":"s1","summary":"second chunk"}
"#,
        )
        .await
        .unwrap();

        let report = migrate_legacy_jsonl(&store, &legacy_path, |texts| async move {
            Ok(texts.iter().map(|_| vec![0.1, 0.2]).collect())
        })
        .await
        .unwrap();

        assert_eq!(report.migrated, 2);
        assert_eq!(report.skipped_malformed, 1);
        assert!(!legacy_path.exists());

        let rows = store.list_summaries_for_thread("t1").await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn missing_file_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let report = migrate_legacy_jsonl(&store, &dir.path().join("nope.jsonl"), |_| async { Ok(vec![]) })
            .await
            .unwrap();
        assert_eq!(report.migrated, 0);
    }
}
