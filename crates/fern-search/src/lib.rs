//! Hybrid retrieval (spec §4.F): fuses cosine-similarity vector search,
//! BM25 full-text search, and a recency decay into one ranked result set
//! over both archived conversation summaries and persistent memories.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fern_embeddings::EmbeddingsClient;
use fern_storage::{cosine_similarity, Store};
use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("storage error: {0}")]
    Storage(#[from] fern_storage::StorageError),
}

/// The hybrid fusion weights are not derived from first principles in the
/// source this system was distilled from; they are preserved verbatim but
/// left configurable rather than hard-coded, per the open question this
/// module resolves.
#[derive(Debug, Clone, Copy)]
pub struct HybridWeights {
    pub vector: f64,
    pub text: f64,
    pub relevance: f64,
    pub recency: f64,
    pub half_life_days: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            vector: 0.7,
            text: 0.3,
            relevance: 0.85,
            recency: 0.15,
            half_life_days: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Archive,
    Memory,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub id: String,
    pub source: Source,
    pub text: String,
    pub relevance_score: f64,
    pub vector_score: f64,
    pub text_score: f64,
    pub recency_score: f64,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub thread_id: Option<String>,
    pub limit: usize,
    pub min_score: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            thread_id: None,
            limit: 5,
            min_score: 0.05,
        }
    }
}

struct Merged {
    source: Source,
    text: String,
    vector_score: f64,
    text_score: f64,
    timestamp: Option<DateTime<Utc>>,
}

pub struct SearchEngine {
    store: Store,
    embeddings: std::sync::Arc<dyn EmbeddingsClient>,
    weights: HybridWeights,
    token_re: Regex,
}

impl SearchEngine {
    pub fn new(store: Store, embeddings: std::sync::Arc<dyn EmbeddingsClient>) -> Self {
        Self::with_weights(store, embeddings, HybridWeights::default())
    }

    pub fn with_weights(store: Store, embeddings: std::sync::Arc<dyn EmbeddingsClient>, weights: HybridWeights) -> Self {
        Self {
            store,
            embeddings,
            weights,
            token_re: Regex::new(r"[A-Za-z0-9]+").unwrap(),
        }
    }

    fn fts_query(&self, query: &str) -> Option<String> {
        let terms: Vec<String> = self
            .token_re
            .find_iter(query)
            .map(|m| format!("\"{}\"", m.as_str()))
            .collect();
        if terms.is_empty() {
            None
        } else {
            Some(terms.join(" AND "))
        }
    }

    pub async fn search(&self, query: &str, opts: SearchOptions) -> Result<Vec<SearchHit>, SearchError> {
        let mut merged: HashMap<String, Merged> = HashMap::new();

        // Step 1-2: vector stage. Skipped when no vector extension loaded
        // (brute-force cosine over every row is only worth paying for once
        // real vector indexing backs it) or when embedding fails.
        if self.store.is_vector_ready() {
            if let Ok(query_vec) = self.embeddings.embed(query).await {
                if !query_vec.is_empty() {
                    let summary_hits = self
                        .store
                        .all_summary_vectors_filtered(opts.thread_id.clone())
                        .await?;
                    let mut scored: Vec<_> = summary_hits
                        .into_iter()
                        .map(|(row, vec)| {
                            let score = cosine_similarity(&query_vec, &vec).max(0.0);
                            (row, score)
                        })
                        .collect();
                    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                    for (row, score) in scored.into_iter().take(opts.limit) {
                        let ts = parse_ts(&row.last_ts);
                        let entry = merged.entry(row.chunk_id.clone()).or_insert(Merged {
                            source: Source::Archive,
                            text: row.summary.clone(),
                            vector_score: 0.0,
                            text_score: 0.0,
                            timestamp: ts,
                        });
                        entry.vector_score = entry.vector_score.max(score);
                    }

                    let memory_hits = self.store.all_memory_vectors().await?;
                    let mut scored: Vec<_> = memory_hits
                        .into_iter()
                        .map(|(row, vec)| {
                            let score = cosine_similarity(&query_vec, &vec).max(0.0);
                            (row, score)
                        })
                        .collect();
                    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                    for (row, score) in scored.into_iter().take(opts.limit) {
                        let ts = parse_ts(&row.created_at);
                        let entry = merged.entry(row.id.clone()).or_insert(Merged {
                            source: Source::Memory,
                            text: row.content.clone(),
                            vector_score: 0.0,
                            text_score: 0.0,
                            timestamp: ts,
                        });
                        entry.vector_score = entry.vector_score.max(score);
                    }
                }
            }
        }

        // Step 3: FTS stage.
        if let Some(fts_query) = self.fts_query(query) {
            let oversample = opts.limit.saturating_mul(4).max(opts.limit);

            let summary_hits = self.store.search_summaries_fts(&fts_query, oversample).await?;
            let mut kept = 0usize;
            for (rank, (row, _bm25_weight)) in summary_hits.into_iter().enumerate() {
                if let Some(tid) = &opts.thread_id {
                    if &row.thread_id != tid {
                        continue;
                    }
                }
                if kept >= opts.limit {
                    break;
                }
                kept += 1;
                let score = (1.0 / (1.0 + rank as f64)).clamp(0.0, 1.0);
                let ts = parse_ts(&row.last_ts);
                let entry = merged.entry(row.chunk_id.clone()).or_insert(Merged {
                    source: Source::Archive,
                    text: row.summary.clone(),
                    vector_score: 0.0,
                    text_score: 0.0,
                    timestamp: ts,
                });
                entry.text_score = entry.text_score.max(score);
            }

            let memory_hits = self.store.search_memories_fts(&fts_query, opts.limit).await?;
            for (rank, (row, _bm25_weight)) in memory_hits.into_iter().enumerate() {
                let score = (1.0 / (1.0 + rank as f64)).clamp(0.0, 1.0);
                let ts = parse_ts(&row.created_at);
                let entry = merged.entry(row.id.clone()).or_insert(Merged {
                    source: Source::Memory,
                    text: row.content.clone(),
                    vector_score: 0.0,
                    text_score: 0.0,
                    timestamp: ts,
                });
                entry.text_score = entry.text_score.max(score);
            }
        }

        let now = Utc::now();
        let mut hits: Vec<SearchHit> = merged
            .into_iter()
            .map(|(id, m)| {
                let relevance = self.weights.vector * m.vector_score + self.weights.text * m.text_score;
                let recency = match m.timestamp {
                    Some(ts) => {
                        let age_days = now.signed_duration_since(ts).num_seconds() as f64 / 86_400.0;
                        0.5f64.powf((age_days.max(0.0)) / self.weights.half_life_days)
                    }
                    None => 0.5,
                };
                let final_score = self.weights.relevance * relevance + self.weights.recency * recency;
                SearchHit {
                    id,
                    source: m.source,
                    text: m.text,
                    relevance_score: final_score,
                    vector_score: m.vector_score,
                    text_score: m.text_score,
                    recency_score: recency,
                }
            })
            .filter(|h| h.relevance_score >= opts.min_score)
            .collect();

        hits.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.recency_score.partial_cmp(&a.recency_score).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(opts.limit);

        Ok(hits)
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fern_embeddings::StubEmbeddingsClient;
    use fern_storage::{MemoryRow, SummaryRow};
    use std::sync::Arc;

    async fn engine_with_store() -> (SearchEngine, Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let embeddings: Arc<dyn EmbeddingsClient> = Arc::new(StubEmbeddingsClient::new(8));
        let engine = SearchEngine::new(store.clone(), embeddings);
        (engine, store, dir)
    }

    #[tokio::test]
    async fn finds_memory_by_full_text() {
        let (engine, store, _dir) = engine_with_store().await;
        store
            .insert_memory(
                MemoryRow {
                    id: "mem1".into(),
                    memory_type: "fact".into(),
                    content: "the launch date is March 3rd".into(),
                    tags: vec![],
                    created_at: Utc::now().to_rfc3339(),
                    updated_at: Utc::now().to_rfc3339(),
                },
                None,
            )
            .await
            .unwrap();

        let hits = engine.search("launch date", SearchOptions::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, Source::Memory);
    }

    #[tokio::test]
    async fn recency_tiebreak_prefers_newer_entry() {
        let (engine, store, _dir) = engine_with_store().await;
        let now = Utc::now();
        let old = now - chrono::Duration::days(90);

        store
            .insert_memory(
                MemoryRow {
                    id: "mem-old".into(),
                    memory_type: "fact".into(),
                    content: "X marks the spot".into(),
                    tags: vec![],
                    created_at: old.to_rfc3339(),
                    updated_at: old.to_rfc3339(),
                },
                None,
            )
            .await
            .unwrap();
        store
            .insert_memory(
                MemoryRow {
                    id: "mem-new".into(),
                    memory_type: "fact".into(),
                    content: "X marks the spot".into(),
                    tags: vec![],
                    created_at: now.to_rfc3339(),
                    updated_at: now.to_rfc3339(),
                },
                None,
            )
            .await
            .unwrap();

        let hits = engine.search("X", SearchOptions::default()).await.unwrap();
        assert_eq!(hits[0].id, "mem-new");
        assert!(hits[0].relevance_score > hits[1].relevance_score);
    }

    #[tokio::test]
    async fn thread_filter_excludes_other_threads() {
        let (engine, store, _dir) = engine_with_store().await;
        store
            .insert_summary(
                SummaryRow {
                    chunk_id: "c1".into(),
                    thread_id: "thread-a".into(),
                    session_id: "s1".into(),
                    summary: "widgets and gadgets".into(),
                    token_count: 5,
                    message_count: 2,
                    first_message_id: "m1".into(),
                    last_message_id: "m2".into(),
                    first_ts: Utc::now().to_rfc3339(),
                    last_ts: Utc::now().to_rfc3339(),
                    created_at: Utc::now().to_rfc3339(),
                },
                None,
            )
            .await
            .unwrap();

        let opts = SearchOptions {
            thread_id: Some("thread-b".into()),
            ..Default::default()
        };
        let hits = engine.search("widgets", opts).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn min_score_drops_weak_matches() {
        let (engine, _store, _dir) = engine_with_store().await;
        let opts = SearchOptions {
            min_score: 0.9,
            ..Default::default()
        };
        let hits = engine.search("nothing indexed", opts).await.unwrap();
        assert!(hits.is_empty());
    }
}
