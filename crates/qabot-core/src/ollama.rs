//! Ollama client for embeddings. Wraps ollama-rs behind the [Embedder] trait.

use async_trait::async_trait;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};
use ollama_rs::Ollama;

use crate::embedding::{EmbedError, Embedder};

/// Ollama's packaging of sentence-transformers all-MiniLM-L6-v2.
pub const DEFAULT_EMBED_MODEL: &str = "all-minilm";
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Thin wrapper around Ollama for embedding.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    inner: Ollama,
    embed_model: String,
}

impl OllamaClient {
    /// Create from URL string, e.g. http://localhost:11434.
    pub fn from_url(url: &str) -> Result<Self, EmbedError> {
        let inner = Ollama::try_new(url).map_err(EmbedError::ParseUrl)?;
        Ok(Self {
            inner,
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
        })
    }

    /// Set the embedding model (e.g. `all-minilm`, `nomic-embed-text`).
    pub fn with_embed_model(mut self, model: impl Into<String>) -> Self {
        self.embed_model = model.into();
        self
    }

    pub fn embed_model(&self) -> &str {
        &self.embed_model
    }

    async fn generate(&self, input: EmbeddingsInput) -> Result<Vec<Vec<f32>>, EmbedError> {
        let req = GenerateEmbeddingsRequest::new(self.embed_model.clone(), input);
        let res = self
            .inner
            .generate_embeddings(req)
            .await
            .map_err(EmbedError::Request)?;
        Ok(res.embeddings)
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut vectors = self.generate(EmbeddingsInput::Single(text.to_string())).await?;
        if vectors.len() != 1 {
            return Err(EmbedError::Shape { expected: 1, got: vectors.len() });
        }
        Ok(vectors.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.generate(EmbeddingsInput::Multiple(texts.to_vec())).await
    }
}
