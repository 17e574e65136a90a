//! All retrieval logic independent of how the bot is reached (Telegram, terminal, ...).
//!
//! Questions are answered from topic corpora by embedding similarity. Ratings of
//! answers are appended to a feedback log for later corpus work (see [dataset]).

pub mod app_data;
pub mod bot;
pub mod config;
pub mod corpus;
pub mod dataset;
pub mod embedding;
pub mod feedback;
pub mod ollama;
pub mod retrieval;
pub mod session;
pub mod spelling;

pub use app_data::app_data_dir;
pub use bot::{Bot, BotError, Event, Reply, ReplyOptions, Transport, TransportError};
pub use config::{
    config_path, load_config, load_config_from, save_config, save_config_to, set_topic_path, Config, ConfigError,
};
pub use corpus::{CorpusDocument, CorpusError, CorpusStore, TopicRegistry};
pub use dataset::{
    csv_to_corpus, feedback_to_corpus, merge_corpora, merge_corpus_dir, read_csv_corpus, split_corpus, write_corpus,
    DatasetError,
};
pub use embedding::{cosine_similarity, EmbedError, Embedder, EmbeddingIndex};
pub use feedback::{read_log, FeedbackError, FeedbackRecord, FeedbackRecorder, Label};
pub use ollama::OllamaClient;
pub use retrieval::{Answer, RetrievalError, RetrievalOptions, Retriever, FALLBACK_ANSWER};
pub use session::{Exchange, Session, SessionId, SessionStore};
pub use spelling::{CorrectionDictionary, Lemmatizer, LemmatizerKind, Normalizer};

/// Returns a short status string. Used to verify the backend is wired up.
pub fn status() -> &'static str {
    "qabot-core ready"
}
