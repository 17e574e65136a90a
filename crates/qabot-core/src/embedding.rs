//! Embedding index: encodes sentences through an [Embedder] and ranks them by
//! cosine similarity against a query.
//!
//! Corpus vectors are cached per topic; corpora are static for the process lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

/// Text -> vector. Same model, same text, same vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

type VectorCell = Arc<OnceCell<Arc<Vec<Vec<f32>>>>>;

/// Shared embedding model plus per-topic candidate vectors.
pub struct EmbeddingIndex {
    embedder: Arc<dyn Embedder>,
    topics: Mutex<HashMap<String, VectorCell>>,
}

impl std::fmt::Debug for EmbeddingIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingIndex").finish_non_exhaustive()
    }
}

impl EmbeddingIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// One vector per sentence, in order. A model answering with a different
    /// number of vectors is an error.
    pub async fn encode_batch(&self, sentences: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if sentences.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.embedder.embed_batch(sentences).await?;
        if vectors.len() != sentences.len() {
            return Err(EmbedError::Shape {
                expected: sentences.len(),
                got: vectors.len(),
            });
        }
        Ok(vectors)
    }

    pub async fn encode_one(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.embedder.embed(text).await
    }

    /// Vectors for a topic's sentences, encoded once. `sentences` must be the
    /// same sequence on every call for a given topic.
    pub async fn topic_vectors(&self, topic: &str, sentences: &[String]) -> Result<Arc<Vec<Vec<f32>>>, EmbedError> {
        let cell = {
            let mut topics = self.topics.lock().await;
            topics.entry(topic.to_lowercase()).or_default().clone()
        };
        let vectors = cell
            .get_or_try_init(|| async {
                let vectors = self.encode_batch(sentences).await?;
                debug!(topic, count = vectors.len(), "encoded corpus");
                Ok::<_, EmbedError>(Arc::new(vectors))
            })
            .await?;
        Ok(vectors.clone())
    }
}

/// Cosine of the angle between `a` and `b`, in [-1, 1]. Zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (na, nb) = (norm(a), norm(b));
    if na <= 0.0 || nb <= 0.0 {
        return 0.0;
    }
    (dot(a, b) / (na * nb)).clamp(-1.0, 1.0)
}

/// Candidate indices with their similarity to `query`, best first. Ties keep input order.
pub fn rank(query: &[f32], candidates: &[Vec<f32>]) -> Vec<(usize, f32)> {
    let mut scored: Vec<(usize, f32)> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (i, cosine_similarity(query, c)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    (0..n).map(|i| a[i] * b[i]).sum()
}

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("invalid Ollama URL: {0}")]
    ParseUrl(#[from] url::ParseError),
    #[error("Ollama request failed: {0}")]
    Request(#[from] ollama_rs::error::OllamaError),
    #[error("model returned {got} vectors for {expected} inputs")]
    Shape { expected: usize, got: usize },
}
