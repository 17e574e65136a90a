//! Retrieval pipeline: normalize → load corpus → embed → rank → threshold.
//!
//! Top-1 nearest neighbour with a confidence gate. Below the threshold (or when
//! the bounded retrieval time runs out) the user gets [FALLBACK_ANSWER].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::corpus::{CorpusError, CorpusStore};
use crate::embedding::{rank, EmbedError, EmbeddingIndex};
use crate::spelling::Normalizer;

pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// Separates the question from the answer inside a corpus sentence.
pub const QA_SEPARATOR: &str = "? ";

pub const FALLBACK_ANSWER: &str = "Пока что я только учусь, поэтому не могу ответить на Ваш вопрос. \
Пожалуйста, обратитесь в каналы технической поддержки в zulip.";

#[derive(Debug, Clone, Copy)]
pub struct RetrievalOptions {
    pub threshold: f32,
    pub timeout: Option<Duration>,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            timeout: None,
        }
    }
}

/// What the engine answered and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    /// Text shown to the user.
    pub text: String,
    /// Best similarity seen; 0 when retrieval timed out.
    pub score: f32,
    /// Corpus sentence the answer came from, if the threshold was met.
    pub matched: Option<String>,
    pub fallback: bool,
}

impl Answer {
    fn fallback(score: f32) -> Self {
        Self {
            text: FALLBACK_ANSWER.to_string(),
            score,
            matched: None,
            fallback: true,
        }
    }
}

/// Answers questions for a topic from its corpus.
#[derive(Debug, Clone)]
pub struct Retriever {
    corpus: Arc<CorpusStore>,
    index: Arc<EmbeddingIndex>,
    normalizer: Arc<Normalizer>,
    options: RetrievalOptions,
}

impl Retriever {
    pub fn new(
        corpus: Arc<CorpusStore>,
        index: Arc<EmbeddingIndex>,
        normalizer: Arc<Normalizer>,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            corpus,
            index,
            normalizer,
            options,
        }
    }

    pub fn corpus(&self) -> &CorpusStore {
        &self.corpus
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Best answer for `query` within `topic`, or the fallback answer when nothing
    /// is similar enough.
    pub async fn retrieve(&self, query: &str, topic: &str) -> Result<Answer, RetrievalError> {
        let work = self.retrieve_unbounded(query, topic);
        match self.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(answer) => answer,
                Err(_) => {
                    warn!(topic, ?limit, "retrieval timed out, answering with fallback");
                    Ok(Answer::fallback(0.0))
                }
            },
            None => work.await,
        }
    }

    async fn retrieve_unbounded(&self, query: &str, topic: &str) -> Result<Answer, RetrievalError> {
        let (sentences, scored) = self.score(query, topic).await?;
        let Some(&(best, score)) = scored.first() else {
            return Err(RetrievalError::CorpusNotFound(topic.to_lowercase()));
        };
        debug!(topic, score, best, "ranked corpus");
        if score.is_nan() || score < self.options.threshold {
            debug!(topic, score, threshold = self.options.threshold, "below threshold");
            return Ok(Answer::fallback(score));
        }
        let sentence = &sentences[best];
        Ok(Answer {
            text: capitalize_first(split_answer(sentence)),
            score,
            matched: Some(sentence.clone()),
            fallback: false,
        })
    }

    /// The `n` most similar corpus sentences with their scores. No threshold applied.
    pub async fn retrieve_top(&self, query: &str, topic: &str, n: usize) -> Result<Vec<(String, f32)>, RetrievalError> {
        let (sentences, scored) = self.score(query, topic).await?;
        Ok(scored
            .into_iter()
            .take(n)
            .map(|(i, score)| (sentences[i].clone(), score))
            .collect())
    }

    async fn score(&self, query: &str, topic: &str) -> Result<(Arc<Vec<String>>, Vec<(usize, f32)>), RetrievalError> {
        if topic.trim().is_empty() {
            return Err(RetrievalError::TopicUnavailable);
        }
        let sentences = self.corpus.get_sentences(topic).await?;
        if sentences.is_empty() {
            return Err(RetrievalError::CorpusNotFound(topic.to_lowercase()));
        }
        let vectors = self.index.topic_vectors(topic, &sentences).await?;
        let query = self.normalizer.normalize(query);
        let query_vector = self.index.encode_one(&query).await?;
        Ok((sentences, rank(&query_vector, &vectors)))
    }
}

/// The answer part of a corpus sentence: everything after the first `"? "`,
/// or the whole sentence when there is no separator.
pub fn split_answer(sentence: &str) -> &str {
    match sentence.split_once(QA_SEPARATOR) {
        Some((_, answer)) => answer,
        None => sentence,
    }
}

/// Upper-cases the first letter, keeping leading whitespace.
pub fn capitalize_first(text: &str) -> String {
    let trimmed = text.trim_start();
    let lead = &text[..text.len() - trimmed.len()];
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => format!("{lead}{}{}", first.to_uppercase(), chars.as_str()),
        None => text.to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("no topic selected")]
    TopicUnavailable,
    #[error("no corpus for topic {0:?}")]
    CorpusNotFound(String),
    #[error("corpus unavailable: {0}")]
    MalformedCorpus(CorpusError),
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedError),
}

impl From<CorpusError> for RetrievalError {
    fn from(e: CorpusError) -> Self {
        match e {
            CorpusError::NotFound(topic) => RetrievalError::CorpusNotFound(topic),
            other => RetrievalError::MalformedCorpus(other),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;

    use super::*;
    use crate::corpus::tests::dataset_dir;
    use crate::corpus::TopicRegistry;
    use crate::embedding::tests::FakeEmbedder;
    use crate::embedding::Embedder;
    use crate::spelling::{CorrectionDictionary, LowercaseLemmatizer};

    pub(crate) const VOCAB: &[&str] = &["подключ", "wekan", "доск", "создать"];

    pub(crate) fn retriever_in(dir: &std::path::Path, embedder: Arc<dyn Embedder>, options: RetrievalOptions) -> Retriever {
        let dictionary = CorrectionDictionary::from_json(r#"{"wekan": ["векан"]}"#).unwrap();
        Retriever::new(
            Arc::new(CorpusStore::new(TopicRegistry::discover(dir, &BTreeMap::new()))),
            Arc::new(EmbeddingIndex::new(embedder)),
            Arc::new(Normalizer::new(&dictionary, Arc::new(LowercaseLemmatizer))),
            options,
        )
    }

    #[test]
    fn split_answer_uses_first_separator_or_whole_text() {
        assert_eq!(split_answer("Как войти? Через логин? Да"), "Через логин? Да");
        assert_eq!(split_answer("Без разделителя"), "Без разделителя");
    }

    #[test]
    fn capitalizes_unicode_first_letter() {
        assert_eq!(capitalize_first("через логин"), "Через логин");
        assert_eq!(capitalize_first("  wiki"), "  Wiki");
        assert_eq!(capitalize_first("1 шаг"), "1 шаг");
        assert_eq!(capitalize_first(""), "");
    }

    #[tokio::test]
    async fn misspelled_query_finds_answer() {
        let dir = dataset_dir();
        let r = retriever_in(dir.path(), Arc::new(FakeEmbedder::new(VOCAB)), RetrievalOptions::default());
        let answer = r.retrieve("как мне подключиться к векан", "Wekan").await.unwrap();
        assert!(!answer.fallback);
        assert!(answer.score >= DEFAULT_THRESHOLD);
        assert_eq!(answer.text, "Через логин и пароль МИЭМ");
    }

    #[tokio::test]
    async fn answer_first_letter_is_capitalized() {
        let dir = dataset_dir();
        let r = retriever_in(dir.path(), Arc::new(FakeEmbedder::new(VOCAB)), RetrievalOptions::default());
        let answer = r.retrieve("создать доску в wekan", "wekan").await.unwrap();
        assert_eq!(answer.text, "Нажмите кнопку добавить доску");
    }

    #[tokio::test]
    async fn below_threshold_returns_fallback() {
        let dir = dataset_dir();
        let r = retriever_in(dir.path(), Arc::new(FakeEmbedder::new(VOCAB)), RetrievalOptions::default());
        let answer = r.retrieve("что такое jitsi", "wekan").await.unwrap();
        assert!(answer.fallback);
        assert_eq!(answer.text, FALLBACK_ANSWER);
        assert!(answer.score < DEFAULT_THRESHOLD);
    }

    #[tokio::test]
    async fn threshold_is_strict_lower_bound() {
        let dir = dataset_dir();
        let strict = RetrievalOptions { threshold: 1.01, timeout: None };
        let r = retriever_in(dir.path(), Arc::new(FakeEmbedder::new(VOCAB)), strict);
        let answer = r.retrieve("Как подключиться к Wekan? Через логин и пароль МИЭМ", "wekan").await.unwrap();
        assert!(answer.fallback);
    }

    #[tokio::test]
    async fn unknown_or_missing_topic_is_an_error() {
        let dir = dataset_dir();
        let r = retriever_in(dir.path(), Arc::new(FakeEmbedder::new(VOCAB)), RetrievalOptions::default());
        assert!(matches!(r.retrieve("вопрос", "taiga").await, Err(RetrievalError::CorpusNotFound(_))));
        assert!(matches!(r.retrieve("вопрос", " ").await, Err(RetrievalError::TopicUnavailable)));
        assert!(matches!(r.retrieve("вопрос", "broken").await, Err(RetrievalError::MalformedCorpus(_))));
    }

    #[tokio::test]
    async fn empty_corpus_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wiki.json"), r#"{"data": [{"paragraphs": []}]}"#).unwrap();
        let r = retriever_in(dir.path(), Arc::new(FakeEmbedder::new(VOCAB)), RetrievalOptions::default());
        assert!(matches!(r.retrieve("вопрос", "wiki").await, Err(RetrievalError::CorpusNotFound(_))));
    }

    #[tokio::test]
    async fn top_n_lists_best_sentences() {
        let dir = dataset_dir();
        let r = retriever_in(dir.path(), Arc::new(FakeEmbedder::new(VOCAB)), RetrievalOptions::default());
        let top = r.retrieve_top("создать доску", "wekan", 5).await.unwrap();
        assert_eq!(top.len(), 2);
        assert!(top[0].0.starts_with("Как создать доску"));
        assert!(top[0].1 >= top[1].1);
    }

    /// Every vector is NaN, as a broken model might return.
    struct NanEmbedder;

    #[async_trait]
    impl Embedder for NanEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            Ok(vec![f32::NAN, 1.0])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(vec![vec![f32::NAN, 1.0]; texts.len()])
        }
    }

    #[tokio::test]
    async fn nan_scores_fall_back() {
        let dir = dataset_dir();
        let r = retriever_in(dir.path(), Arc::new(NanEmbedder), RetrievalOptions::default());
        let answer = r.retrieve("как подключиться", "wekan").await.unwrap();
        assert!(answer.fallback);
        assert!(answer.score.is_nan());
        assert_eq!(answer.text, FALLBACK_ANSWER);
    }

    struct StalledEmbedder;

    #[async_trait]
    impl Embedder for StalledEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            std::future::pending().await
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_model_falls_back_after_timeout() {
        let dir = dataset_dir();
        let options = RetrievalOptions { threshold: DEFAULT_THRESHOLD, timeout: Some(Duration::from_secs(5)) };
        let r = retriever_in(dir.path(), Arc::new(StalledEmbedder), options);
        let answer = r.retrieve("как подключиться", "wekan").await.unwrap();
        assert!(answer.fallback);
        assert_eq!(answer.text, FALLBACK_ANSWER);
    }
}
