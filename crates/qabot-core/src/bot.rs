//! Conversation handler: turns transport events into replies.
//!
//! The transport (Telegram, a terminal, ...) only delivers [Event]s for a session
//! and displays [Reply]s. Every recoverable failure becomes a user-facing text
//! here; only embedding failures are returned to the caller.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::corpus::{CorpusStore, TopicRegistry};
use crate::embedding::{EmbedError, Embedder, EmbeddingIndex};
use crate::feedback::{FeedbackError, FeedbackRecorder, Label};
use crate::ollama::OllamaClient;
use crate::retrieval::{RetrievalError, RetrievalOptions, Retriever, FALLBACK_ANSWER};
use crate::session::{Exchange, SessionId, SessionStore};
use crate::spelling::{CorrectionDictionary, Normalizer, SpellingError};

pub const CHOOSE_TOPIC_FIRST: &str = "Пожалуйста, сначала выберите тему.";
pub const THANKS_LIKE: &str = "Спасибо за положительную оценку!";
pub const THANKS_DISLIKE: &str = "Спасибо за оценку, теперь я стану ещё умнее!";
pub const NOTHING_TO_RATE: &str = "Невозможно получить текст сообщений, на которые вы отреагировали.";
pub const FEEDBACK_FAILED: &str = "Не удалось сохранить оценку, попробуйте позже.";

/// Something the user did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    /// A question.
    Text(String),
    /// Topic picked by command or button.
    Topic(String),
    Like,
    Dislike,
}

impl Event {
    /// Parses `/start`, `/like`, `/dislike` and `/<topic>` commands; anything else is a question.
    /// A `@botname` suffix on the command is ignored.
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        let Some(command) = trimmed.strip_prefix('/') else {
            return Event::Text(text.to_string());
        };
        let name = command.split_whitespace().next().unwrap_or("");
        let name = name.split('@').next().unwrap_or("").to_lowercase();
        match name.as_str() {
            "" => Event::Text(text.to_string()),
            "start" => Event::Start,
            "like" => Event::Like,
            "dislike" => Event::Dislike,
            _ => Event::Topic(name),
        }
    }

    /// Parses button callback data: `like`, `dislike`, otherwise a topic.
    pub fn from_callback(data: &str) -> Self {
        match data.trim().to_lowercase().as_str() {
            "like" => Event::Like,
            "dislike" => Event::Dislike,
            _ => Event::Topic(data.trim().to_string()),
        }
    }
}

/// Interactive options shown with a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOptions {
    /// Like / dislike buttons for the answer.
    Rating,
    /// One button per topic.
    Topics(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub options: Option<ReplyOptions>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            options: None,
        }
    }

    pub fn with_options(text: impl Into<String>, options: ReplyOptions) -> Self {
        Self {
            text: text.into(),
            options: Some(options),
        }
    }
}

/// Delivery side of a chat transport.
#[async_trait]
pub trait Transport: Send {
    /// Next inbound event, or `None` when the transport is closed.
    /// Must be cancel-safe: it is raced against outgoing replies.
    async fn next_event(&mut self) -> Option<(SessionId, Event)>;

    async fn send(&mut self, session: &str, reply: Reply) -> Result<(), TransportError>;
}

/// Routes events to retrieval, session state and feedback.
#[derive(Debug, Clone)]
pub struct Bot {
    retriever: Retriever,
    sessions: Arc<SessionStore>,
    feedback: Arc<FeedbackRecorder>,
}

impl Bot {
    pub fn new(retriever: Retriever, sessions: Arc<SessionStore>, feedback: Arc<FeedbackRecorder>) -> Self {
        Self {
            retriever,
            sessions,
            feedback,
        }
    }

    /// Wires every component from config, embedding with Ollama.
    pub fn from_config(config: &Config) -> Result<Self, BotError> {
        let client = OllamaClient::from_url(&config.ollama_url)?.with_embed_model(config.embed_model.clone());
        Self::with_embedder(config, Arc::new(client))
    }

    /// Wires every component from config around the given embedding model.
    pub fn with_embedder(config: &Config, embedder: Arc<dyn Embedder>) -> Result<Self, BotError> {
        let dictionary = if config.dictionary_path.is_file() {
            CorrectionDictionary::load(&config.dictionary_path)?
        } else {
            warn!(path = %config.dictionary_path.display(), "correction dictionary not found, spelling is left as typed");
            CorrectionDictionary::default()
        };
        let normalizer = Arc::new(Normalizer::new(&dictionary, config.lemmatizer.build()));
        let registry = TopicRegistry::discover(&config.dataset_dir, &config.topics);
        debug!(topics = ?registry.names(), "topic registry");

        let retriever = Retriever::new(
            Arc::new(CorpusStore::new(registry)),
            Arc::new(EmbeddingIndex::new(embedder)),
            normalizer.clone(),
            RetrievalOptions {
                threshold: config.threshold,
                timeout: config.retrieval_timeout(),
            },
        );
        let sessions = Arc::new(SessionStore::new());
        let feedback = Arc::new(FeedbackRecorder::new(&config.feedback_path, sessions.clone(), normalizer));
        Ok(Self::new(retriever, sessions, feedback))
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn topics(&self) -> Vec<String> {
        self.retriever.corpus().registry().names()
    }

    pub fn welcome(&self) -> Reply {
        let topics = self.topics();
        let list: String = topics.iter().map(|t| format!("{}\n", display_topic(t))).collect();
        Reply::with_options(
            format!(
                "Привет! Я чат-бот, созданный для ответа на технические вопросы сервисов МИЭМ. \
                 Вы можете задать мне вопросы по следующим темам:\n{list}\n\
                 Пожалуйста, выберите тему, чтобы продолжить."
            ),
            ReplyOptions::Topics(topics),
        )
    }

    /// Handles one event. Events of one session are processed one at a time.
    pub async fn handle(&self, session: &str, event: Event) -> Result<Reply, BotError> {
        match event {
            Event::Start => Ok(self.welcome()),
            Event::Topic(topic) => {
                let topic = topic.trim().to_lowercase();
                let registry = self.retriever.corpus().registry();
                let known = registry.contains(&topic) || registry.path_for(&topic).is_some_and(|p| p.is_file());
                if !known {
                    return Ok(Reply::with_options(
                        format!("Тема {topic} не найдена. Пожалуйста, выберите тему из списка."),
                        ReplyOptions::Topics(self.topics()),
                    ));
                }
                let reply = format!("Вы выбрали тему: {topic}. Пожалуйста, задайте Ваш вопрос.");
                self.sessions.handle(session).await.lock().await.selected_topic = Some(topic);
                Ok(Reply::text(reply))
            }
            Event::Text(question) => self.answer(session, question).await,
            Event::Like => Ok(self.rate(session, Label::Like).await),
            Event::Dislike => Ok(self.rate(session, Label::Dislike).await),
        }
    }

    /// Holds the session lock from reading the topic until the exchange is stored.
    async fn answer(&self, session: &str, question: String) -> Result<Reply, BotError> {
        let handle = self.sessions.handle(session).await;
        let mut state = handle.lock().await;
        let Some(topic) = state.selected_topic.clone() else {
            return Ok(Reply::with_options(CHOOSE_TOPIC_FIRST, ReplyOptions::Topics(self.topics())));
        };
        match self.retriever.retrieve(&question, &topic).await {
            Ok(answer) => {
                state.last_exchange = Some(Exchange {
                    question,
                    answer: answer.text.clone(),
                });
                Ok(Reply::with_options(answer.text, ReplyOptions::Rating))
            }
            Err(RetrievalError::TopicUnavailable | RetrievalError::CorpusNotFound(_)) => {
                Ok(Reply::with_options(CHOOSE_TOPIC_FIRST, ReplyOptions::Topics(self.topics())))
            }
            Err(RetrievalError::MalformedCorpus(e)) => {
                error!(session, topic = %topic, error = %e, "corpus unavailable");
                Ok(Reply::text(FALLBACK_ANSWER))
            }
            Err(RetrievalError::Embedding(e)) => Err(BotError::Embedding(e)),
        }
    }

    /// Rates the last exchange. Waits for an in-flight question of the same session.
    async fn rate(&self, session: &str, label: Label) -> Reply {
        match self.feedback.record(session, label).await {
            Ok(_) => {
                Reply::text(match label {
                    Label::Like => THANKS_LIKE,
                    Label::Dislike => THANKS_DISLIKE,
                })
            }
            Err(FeedbackError::NoActiveExchange) => Reply::text(NOTHING_TO_RATE),
            Err(e) => {
                error!(session, error = %e, "feedback not saved");
                Reply::text(FEEDBACK_FAILED)
            }
        }
    }

    /// Drives a transport until it closes and every reply is sent.
    ///
    /// Each session gets its own worker task: a session's events are answered in
    /// order, while a slow answer for one session does not hold up the others.
    pub async fn serve<T: Transport>(&self, transport: &mut T) -> Result<(), BotError> {
        let (reply_tx, mut replies) = mpsc::unbounded_channel::<(SessionId, Result<Reply, BotError>)>();
        let mut reply_tx = Some(reply_tx);
        let mut workers: HashMap<SessionId, mpsc::UnboundedSender<Event>> = HashMap::new();
        loop {
            tokio::select! {
                inbound = transport.next_event(), if reply_tx.is_some() => match inbound {
                    Some((session, event)) => {
                        let Some(tx) = reply_tx.as_ref() else { continue };
                        let worker = workers
                            .entry(session.clone())
                            .or_insert_with(|| self.spawn_worker(session.clone(), tx.clone()));
                        if worker.send(event).is_err() {
                            warn!(session = %session, "session worker stopped, event dropped");
                        }
                    }
                    None => {
                        // Closing the event queues lets workers finish and drop their reply senders.
                        workers.clear();
                        reply_tx = None;
                    }
                },
                Some((session, reply)) = replies.recv() => transport.send(&session, reply?).await?,
                else => break,
            }
        }
        Ok(())
    }

    fn spawn_worker(
        &self,
        session: SessionId,
        replies: mpsc::UnboundedSender<(SessionId, Result<Reply, BotError>)>,
    ) -> mpsc::UnboundedSender<Event> {
        let (tx, mut events) = mpsc::unbounded_channel();
        let bot = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let reply = bot.handle(&session, event).await;
                if replies.send((session.clone(), reply)).is_err() {
                    break;
                }
            }
        });
        tx
    }
}

/// Topic name as shown to users: first letter upper-cased.
pub fn display_topic(topic: &str) -> String {
    crate::retrieval::capitalize_first(topic)
}

#[derive(Debug, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("embedding model unavailable: {0}")]
    Embedding(#[from] EmbedError),
    #[error("dictionary error: {0}")]
    Dictionary(#[from] SpellingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
