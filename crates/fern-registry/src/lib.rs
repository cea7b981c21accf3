//! Thread-to-session registry (spec §4.C). Maps an inbound channel thread
//! (a Slack thread, a GitHub issue, whatever upstream channel) onto a
//! long-lived LLM session, so a conversation stays coherent across
//! multiple inbound messages without the caller tracking session ids
//! itself.
//!
//! Entries expire after `THREAD_SESSION_TTL` (default one hour) of
//! inactivity: past that window a new session is created rather than
//! resuming a conversation the model may no longer have warm context for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use fern_llm::LlmClient;
use fern_storage::{Store, ThreadSessionRow};

pub const DEFAULT_THREAD_SESSION_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("storage error: {0}")]
    Storage(#[from] fern_storage::StorageError),
    #[error("llm error: {0}")]
    Llm(#[from] fern_llm::LlmError),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    session_id: String,
    share_url: Option<String>,
    updated_at: chrono::DateTime<Utc>,
}

pub struct SessionRegistry {
    store: Store,
    llm: Arc<dyn LlmClient>,
    ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl SessionRegistry {
    pub fn new(store: Store, llm: Arc<dyn LlmClient>) -> Self {
        Self::with_ttl(store, llm, DEFAULT_THREAD_SESSION_TTL)
    }

    pub fn with_ttl(store: Store, llm: Arc<dyn LlmClient>, ttl: Duration) -> Self {
        Self {
            store,
            llm,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the session id (and provider share URL, if any) bound to
    /// `thread_id`, creating a fresh session if none exists or the
    /// existing one has aged past the TTL.
    pub async fn get_or_create_session(
        &self,
        thread_id: &str,
        title: Option<&str>,
    ) -> Result<(String, Option<String>), RegistryError> {
        if let Some(entry) = self.fresh_cache_entry(thread_id) {
            self.touch(thread_id, &entry);
            return Ok((entry.session_id, entry.share_url));
        }

        if let Some(row) = self.store.get_thread_session(thread_id).await? {
            if !self.is_stale(row.updated_at.parse().ok()) {
                self.touch_db_and_cache(thread_id, &row).await?;
                return Ok((row.session_id, row.share_url));
            }
            self.store.delete_thread_session(thread_id).await?;
        }

        let handle = self.llm.create_session(title).await?;
        let now = Utc::now().to_rfc3339();
        self.store
            .upsert_thread_session(ThreadSessionRow {
                thread_id: thread_id.to_string(),
                session_id: handle.session_id.clone(),
                share_url: handle.share_url.clone(),
                created_at: now.clone(),
                updated_at: now.clone(),
            })
            .await?;
        self.cache.lock().unwrap().insert(
            thread_id.to_string(),
            CacheEntry {
                session_id: handle.session_id.clone(),
                share_url: handle.share_url.clone(),
                updated_at: Utc::now(),
            },
        );

        Ok((handle.session_id, handle.share_url))
    }

    fn fresh_cache_entry(&self, thread_id: &str) -> Option<CacheEntry> {
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(thread_id)?;
        if self.is_stale(Some(entry.updated_at)) {
            None
        } else {
            Some(entry.clone())
        }
    }

    fn touch(&self, thread_id: &str, entry: &CacheEntry) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(thread_id.to_string(), CacheEntry {
            updated_at: Utc::now(),
            ..entry.clone()
        });
    }

    async fn touch_db_and_cache(&self, thread_id: &str, row: &ThreadSessionRow) -> Result<(), RegistryError> {
        let now = Utc::now().to_rfc3339();
        self.store
            .upsert_thread_session(ThreadSessionRow {
                thread_id: thread_id.to_string(),
                session_id: row.session_id.clone(),
                share_url: row.share_url.clone(),
                created_at: row.created_at.clone(),
                updated_at: now.clone(),
            })
            .await?;
        self.cache.lock().unwrap().insert(
            thread_id.to_string(),
            CacheEntry {
                session_id: row.session_id.clone(),
                share_url: row.share_url.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn is_stale(&self, updated_at: Option<chrono::DateTime<Utc>>) -> bool {
        match updated_at {
            Some(ts) => Utc::now().signed_duration_since(ts).to_std().unwrap_or(Duration::ZERO) > self.ttl,
            None => true,
        }
    }

    /// Sweeps both the in-memory cache and the backing table for entries
    /// past the TTL. Guarded by the same lock the lookup path uses, so a
    /// sweep never races a concurrent `get_or_create_session` into
    /// evicting an entry it just refreshed.
    pub async fn sweep_expired(&self) -> Result<usize, RegistryError> {
        let cutoff = (Utc::now() - chrono::Duration::from_std(self.ttl).unwrap_or_default()).to_rfc3339();
        let stale_rows = self.store.list_stale_thread_sessions(&cutoff).await?;

        {
            let mut cache = self.cache.lock().unwrap();
            cache.retain(|_, entry| !self.is_stale(Some(entry.updated_at)));
        }

        for row in &stale_rows {
            self.store.delete_thread_session(&row.thread_id).await?;
        }

        Ok(stale_rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fern_llm::stub::EchoLlmClient;

    async fn registry_with_ttl(ttl: Duration) -> (SessionRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let llm = Arc::new(EchoLlmClient::new());
        (SessionRegistry::with_ttl(store, llm, ttl), dir)
    }

    #[tokio::test]
    async fn creates_new_session_for_unknown_thread() {
        let (registry, _dir) = registry_with_ttl(Duration::from_secs(3600)).await;
        let (session_id, _) = registry.get_or_create_session("thread-1", None).await.unwrap();
        assert!(!session_id.is_empty());
    }

    #[tokio::test]
    async fn reuses_session_within_ttl() {
        let (registry, _dir) = registry_with_ttl(Duration::from_secs(3600)).await;
        let (first, _) = registry.get_or_create_session("thread-1", None).await.unwrap();
        let (second, _) = registry.get_or_create_session("thread-1", None).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn creates_fresh_session_once_ttl_elapses() {
        let (registry, _dir) = registry_with_ttl(Duration::from_millis(10)).await;
        let (first, _) = registry.get_or_create_session("thread-1", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let (second, _) = registry.get_or_create_session("thread-1", None).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let (registry, _dir) = registry_with_ttl(Duration::from_millis(10)).await;
        registry.get_or_create_session("stale-thread", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.get_or_create_session("fresh-thread", None).await.unwrap();

        let swept = registry.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
    }
}
