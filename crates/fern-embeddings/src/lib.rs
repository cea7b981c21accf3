//! Embedding generation (spec §4.B). A thin, provider-agnostic interface:
//! text in, vectors out. Callers treat an empty vector as a legal "could
//! not embed" result rather than an error — a memory or chunk with no
//! embedding still participates in FTS search, just not the vector stage.

mod http;
pub mod stub;

pub use http::HttpEmbeddingsClient;
pub use stub::StubEmbeddingsClient;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embeddings request failed: {0}")]
    Request(String),
    #[error("embeddings provider returned malformed response: {0}")]
    MalformedResponse(String),
}

/// No internal retry: a transient provider failure surfaces to the caller,
/// which decides whether to retry, skip the embedding, or fail the
/// enclosing operation.
#[async_trait]
pub trait EmbeddingsClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self
            .embed_batch(std::slice::from_ref(&text.to_string()))
            .await?
            .into_iter()
            .next()
            .unwrap_or_default())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}
