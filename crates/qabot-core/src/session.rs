//! Per-session conversation state: selected topic and the last answered exchange.
//!
//! Lives for the process lifetime only. Each session has its own lock, so one
//! user's rapid messages serialize while other users proceed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

/// Stable identifier of a conversation (chat id, user id, ...).
pub type SessionId = String;

/// Last question and the answer the bot gave to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub selected_topic: Option<String>,
    pub last_exchange: Option<Exchange>,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session's own lock, created empty on first access.
    pub async fn handle(&self, id: &str) -> Arc<Mutex<Session>> {
        if let Some(session) = self.sessions.read().await.get(id) {
            return session.clone();
        }
        self.sessions.write().await.entry(id.to_string()).or_default().clone()
    }

    /// Snapshot of the session.
    pub async fn get(&self, id: &str) -> Session {
        self.handle(id).await.lock().await.clone()
    }

    pub async fn set_topic(&self, id: &str, topic: &str) {
        self.handle(id).await.lock().await.selected_topic = Some(topic.trim().to_lowercase());
    }

    pub async fn record_exchange(&self, id: &str, question: impl Into<String>, answer: impl Into<String>) {
        self.handle(id).await.lock().await.last_exchange = Some(Exchange {
            question: question.into(),
            answer: answer.into(),
        });
    }

    pub async fn last_exchange(&self, id: &str) -> Option<Exchange> {
        self.handle(id).await.lock().await.last_exchange.clone()
    }

    /// Forgets the session entirely.
    pub async fn clear(&self, id: &str) {
        self.sessions.write().await.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
