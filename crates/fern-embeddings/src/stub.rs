//! Deterministic embedding stand-in for tests: same text always produces
//! the same vector, with no network dependency.

use async_trait::async_trait;

use crate::{EmbeddingError, EmbeddingsClient};

pub struct StubEmbeddingsClient {
    dims: usize,
}

impl StubEmbeddingsClient {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl Default for StubEmbeddingsClient {
    fn default() -> Self {
        Self::new(16)
    }
}

fn hash_embed(text: &str, dims: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dims];
    for (i, byte) in text.bytes().enumerate() {
        vec[i % dims] += byte as f32 / 255.0;
    }
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

#[async_trait]
impl EmbeddingsClient for StubEmbeddingsClient {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| hash_embed(t, self.dims)).collect())
    }
}
