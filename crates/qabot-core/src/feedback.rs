//! Feedback log: user ratings of answers, appended as labeled training data.
//!
//! Each record is one pretty-printed JSON object followed by a newline. The
//! file is never rewritten, only appended to.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::session::{Exchange, SessionStore};
use crate::spelling::Normalizer;

/// Upper bound of the random ids put into records.
const MAX_RECORD_ID: u32 = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Like,
    Dislike,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Label::Like => "like",
            Label::Dislike => "dislike",
        })
    }
}

impl std::str::FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "like" => Ok(Label::Like),
            "dislike" => Ok(Label::Dislike),
            other => Err(format!("unknown label {other:?} (expected like or dislike)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackAnswer {
    pub answer_start: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackQa {
    pub id: u32,
    pub question: String,
    pub answers: Vec<FeedbackAnswer>,
}

/// One rated exchange, in the shape of a corpus paragraph plus a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub context: String,
    pub label: Label,
    pub id: u32,
    pub qas: Vec<FeedbackQa>,
}

impl FeedbackRecord {
    pub fn new(question: &str, answer: &str, label: Label, rng: &mut impl Rng) -> Self {
        Self {
            context: format!("{question} {answer}"),
            label,
            id: rng.gen_range(1..=MAX_RECORD_ID),
            qas: vec![FeedbackQa {
                id: rng.gen_range(1..=MAX_RECORD_ID),
                question: question.to_string(),
                answers: vec![FeedbackAnswer {
                    answer_start: rng.gen_range(1..=MAX_RECORD_ID),
                    text: answer.to_string(),
                }],
            }],
        }
    }

    pub fn question(&self) -> Option<&str> {
        self.qas.first().map(|qa| qa.question.as_str())
    }

    pub fn answer(&self) -> Option<&str> {
        self.qas.first().and_then(|qa| qa.answers.first()).map(|a| a.text.as_str())
    }

    /// Pretty JSON (4-space indent) plus a trailing newline.
    fn render(&self) -> Result<Vec<u8>, FeedbackError> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser).map_err(FeedbackError::Serialize)?;
        buf.push(b'\n');
        Ok(buf)
    }
}

/// Appends ratings of the last exchange of a session to the feedback log.
#[derive(Debug)]
pub struct FeedbackRecorder {
    path: PathBuf,
    sessions: Arc<SessionStore>,
    normalizer: Arc<Normalizer>,
    writer: Mutex<()>,
}

impl FeedbackRecorder {
    pub fn new(path: impl Into<PathBuf>, sessions: Arc<SessionStore>, normalizer: Arc<Normalizer>) -> Self {
        Self {
            path: path.into(),
            sessions,
            normalizer,
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rates the session's last exchange. Nothing is written when there is none.
    pub async fn record(&self, session: &str, label: Label) -> Result<FeedbackRecord, FeedbackError> {
        let exchange = self.sessions.last_exchange(session).await;
        let record = self.rate(exchange.as_ref(), label).await?;
        info!(session, %label, id = record.id, "recorded feedback");
        Ok(record)
    }

    /// Rates an exchange the caller already holds (e.g. under the session lock).
    pub async fn rate(&self, exchange: Option<&Exchange>, label: Label) -> Result<FeedbackRecord, FeedbackError> {
        let exchange = exchange.ok_or(FeedbackError::NoActiveExchange)?;
        let question = self.normalizer.normalize(&exchange.question);
        let record = FeedbackRecord::new(&question, &exchange.answer, label, &mut rand::thread_rng());
        self.append(&record).await?;
        Ok(record)
    }

    /// Writes one record with a single append; writers are serialized.
    pub async fn append(&self, record: &FeedbackRecord) -> Result<(), FeedbackError> {
        let bytes = record.render()?;
        let _guard = self.writer.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(FeedbackError::Write)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(FeedbackError::Write)?;
        file.write_all(&bytes).await.map_err(FeedbackError::Write)?;
        file.flush().await.map_err(FeedbackError::Write)?;
        Ok(())
    }
}

/// All records in a feedback log. A missing file is an empty log.
pub fn read_log(path: &Path) -> Result<Vec<FeedbackRecord>, FeedbackError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(FeedbackError::Read(e)),
    };
    serde_json::Deserializer::from_str(&raw)
        .into_iter::<FeedbackRecord>()
        .collect::<Result<_, _>>()
        .map_err(FeedbackError::Parse)
}

#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    #[error("no answered question to rate in this session")]
    NoActiveExchange,
    #[error("failed to serialize feedback: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to write feedback log: {0}")]
    Write(std::io::Error),
    #[error("failed to read feedback log: {0}")]
    Read(std::io::Error),
    #[error("malformed feedback log: {0}")]
    Parse(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::spelling::{CorrectionDictionary, LowercaseLemmatizer};

    fn recorder(dir: &Path) -> (Arc<SessionStore>, FeedbackRecorder) {
        let sessions = Arc::new(SessionStore::new());
        let dictionary = CorrectionDictionary::from_json(r#"{"wekan": ["векан"]}"#).unwrap();
        let normalizer = Arc::new(Normalizer::new(&dictionary, Arc::new(LowercaseLemmatizer)));
        let recorder = FeedbackRecorder::new(dir.join("logs").join("feedback.json"), sessions.clone(), normalizer);
        (sessions, recorder)
    }

    #[tokio::test]
    async fn like_appends_one_normalized_record() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, recorder) = recorder(dir.path());
        sessions.record_exchange("7", "как войти в векан", "Через логин и пароль МИЭМ").await;

        recorder.record("7", Label::Like).await.unwrap();

        let log = read_log(recorder.path()).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].label, Label::Like);
        assert_eq!(log[0].context, "как войти в wekan Через логин и пароль МИЭМ");
        assert_eq!(log[0].question(), Some("как войти в wekan"));
        assert_eq!(log[0].answer(), Some("Через логин и пароль МИЭМ"));
    }

    #[tokio::test]
    async fn no_exchange_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (_, recorder) = recorder(dir.path());
        assert!(matches!(recorder.record("7", Label::Dislike).await, Err(FeedbackError::NoActiveExchange)));
        assert!(!recorder.path().exists());
    }

    #[tokio::test]
    async fn concurrent_appends_stay_whole() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, recorder) = recorder(dir.path());
        let recorder = Arc::new(recorder);
        for i in 0..16 {
            sessions.record_exchange(&i.to_string(), format!("вопрос {i}"), "ответ").await;
        }
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let recorder = recorder.clone();
                tokio::spawn(async move { recorder.record(&i.to_string(), Label::Like).await.unwrap() })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(read_log(recorder.path()).unwrap().len(), 16);
    }

    #[test]
    fn record_layout_matches_log_format() {
        let record = FeedbackRecord::new("q", "a", Label::Dislike, &mut StdRng::seed_from_u64(1));
        let value: serde_json::Value = serde_json::from_slice(&record.render().unwrap()).unwrap();
        assert_eq!(value["label"], "dislike");
        assert_eq!(value["context"], "q a");
        assert_eq!(value["qas"][0]["answers"][0]["text"], "a");
        let id = value["id"].as_u64().unwrap();
        assert!((1..=20_000).contains(&id));
    }

    #[test]
    fn labels_parse_and_display() {
        assert_eq!("Like".parse::<Label>(), Ok(Label::Like));
        assert_eq!(Label::Dislike.to_string(), "dislike");
        assert!("meh".parse::<Label>().is_err());
    }

    #[test]
    fn missing_log_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_log(&dir.path().join("none.json")).unwrap().is_empty());
    }
}
