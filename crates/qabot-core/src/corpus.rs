//! Topic corpora: the question/answer datasets retrieval searches over.
//!
//! A corpus file holds `data[].paragraphs[].qas[]`, each QA with a question and
//! a list of answers. Only the question and the first answer's text are used.
//! Topics resolve to files through a [TopicRegistry]; parsed corpora are cached
//! for the process lifetime.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A whole dataset file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusDocument {
    pub data: Vec<CorpusData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusData {
    #[serde(default)]
    pub title: String,
    pub paragraphs: Vec<Paragraph>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Paragraph {
    #[serde(default)]
    pub context: String,
    pub qas: Vec<Qa>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Qa {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub question: String,
    pub answers: Vec<Answer>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    #[serde(default)]
    pub answer_start: i64,
}

/// Distinct `question + " " + answer` sentences of a document, in sorted order.
/// QA entries without answers are skipped.
pub fn extract_sentences(doc: &CorpusDocument) -> Vec<String> {
    let sentences: BTreeSet<String> = doc
        .data
        .iter()
        .flat_map(|d| &d.paragraphs)
        .flat_map(|p| &p.qas)
        .filter_map(|qa| qa.answers.first().map(|a| format!("{} {}", qa.question, a.text)))
        .collect();
    sentences.into_iter().collect()
}

/// Parses a corpus file.
pub fn read_corpus(path: &Path) -> Result<CorpusDocument, CorpusError> {
    let raw = std::fs::read_to_string(path).map_err(|e| CorpusError::Read(path.to_path_buf(), e))?;
    serde_json::from_str(&raw).map_err(|e| CorpusError::Malformed(path.to_path_buf(), e))
}

/// Whether `name` can be used as a file name inside the dataset directory:
/// word characters, spaces and dashes only.
pub fn is_topic_name(name: &str) -> bool {
    !name.trim().is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ' ')
}

/// Topic name (lower-cased) -> corpus file.
#[derive(Debug, Clone, Default)]
pub struct TopicRegistry {
    dataset_dir: PathBuf,
    topics: BTreeMap<String, PathBuf>,
}

impl TopicRegistry {
    /// Registry with no discovered topics; lookups fall back to `<dir>/<topic>.json`.
    pub fn new(dataset_dir: impl Into<PathBuf>) -> Self {
        Self {
            dataset_dir: dataset_dir.into(),
            topics: BTreeMap::new(),
        }
    }

    /// Scans `dataset_dir` for `*.json` files (file stem is the topic), then
    /// applies `extra` on top. A missing directory yields only `extra`.
    pub fn discover(dataset_dir: &Path, extra: &BTreeMap<String, PathBuf>) -> Self {
        let mut registry = Self::new(dataset_dir);
        if dataset_dir.is_dir() {
            for entry in WalkDir::new(dataset_dir)
                .max_depth(1)
                .follow_links(true)
                .into_iter()
                .filter_map(Result::ok)
            {
                let path = entry.path();
                if path.is_file() && path.extension().map_or(false, |e| e == "json") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        registry.insert(stem, path.to_path_buf());
                    }
                }
            }
        } else {
            debug!(dir = %dataset_dir.display(), "dataset directory does not exist");
        }
        for (topic, path) in extra {
            registry.insert(topic, path.clone());
        }
        registry
    }

    pub fn insert(&mut self, topic: &str, path: PathBuf) {
        self.topics.insert(topic.to_lowercase(), path);
    }

    /// Corpus file for `topic`: a registered entry, else `<dataset_dir>/<topic>.json`.
    /// Unregistered names that are not plain file names (see [is_topic_name]) resolve to nothing.
    pub fn path_for(&self, topic: &str) -> Option<PathBuf> {
        let key = topic.trim().to_lowercase();
        if let Some(path) = self.topics.get(&key) {
            return Some(path.clone());
        }
        is_topic_name(&key).then(|| self.dataset_dir.join(format!("{key}.json")))
    }

    /// Registered topic names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(&topic.trim().to_lowercase())
    }
}

type SentenceCell = Arc<OnceCell<Arc<Vec<String>>>>;

/// Lazily loaded, per-topic cache of corpus sentences.
#[derive(Debug)]
pub struct CorpusStore {
    registry: TopicRegistry,
    cache: Mutex<HashMap<String, SentenceCell>>,
}

impl CorpusStore {
    pub fn new(registry: TopicRegistry) -> Self {
        Self {
            registry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    /// Sentences for `topic`. Concurrent first calls for one topic parse the file once.
    /// Failures are not cached.
    pub async fn get_sentences(&self, topic: &str) -> Result<Arc<Vec<String>>, CorpusError> {
        let key = topic.trim().to_lowercase();
        let Some(path) = self.registry.path_for(&key) else {
            return Err(CorpusError::NotFound(key));
        };
        let cell = {
            let mut cache = self.cache.lock().await;
            cache.entry(key.clone()).or_default().clone()
        };
        let sentences = cell
            .get_or_try_init(|| async {
                if !path.is_file() {
                    return Err(CorpusError::NotFound(key.clone()));
                }
                let doc = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| CorpusError::Read(path.clone(), e))?;
                let doc: CorpusDocument = serde_json::from_str(&doc).map_err(|e| {
                    warn!(topic = %key, path = %path.display(), error = %e, "malformed corpus file");
                    CorpusError::Malformed(path.clone(), e)
                })?;
                let sentences = extract_sentences(&doc);
                debug!(topic = %key, count = sentences.len(), "loaded corpus");
                Ok(Arc::new(sentences))
            })
            .await?;
        Ok(sentences.clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("no corpus for topic {0:?}")]
    NotFound(String),
    #[error("read error for {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("malformed corpus file {0}: {1}")]
    Malformed(PathBuf, serde_json::Error),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const WEKAN: &str = r#"{
        "data": [{
            "title": "Custom QA Dataset",
            "paragraphs": [
                {"context": "Через логин и пароль МИЭМ", "qas": [
                    {"id": "1", "question": "Как подключиться к Wekan?",
                     "answers": [{"text": "Через логин и пароль МИЭМ", "answer_start": 0}]}
                ]},
                {"context": "", "qas": [
                    {"id": "2", "question": "Как создать доску в Wekan?",
                     "answers": [{"text": "нажмите кнопку добавить доску", "answer_start": 0}]},
                    {"id": "3", "question": "Как подключиться к Wekan?",
                     "answers": [{"text": "Через логин и пароль МИЭМ", "answer_start": 0}]},
                    {"id": "4", "question": "Без ответа?", "answers": []}
                ]}
            ]
        }],
        "version": "1.0"
    }"#;

    pub(crate) fn dataset_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wekan.json"), WEKAN).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{\"data\": 5}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a corpus").unwrap();
        dir
    }

    #[test]
    fn sentences_are_distinct_and_skip_empty_answers() {
        let doc: CorpusDocument = serde_json::from_str(WEKAN).unwrap();
        assert_eq!(
            extract_sentences(&doc),
            vec![
                "Как подключиться к Wekan? Через логин и пароль МИЭМ".to_string(),
                "Как создать доску в Wekan? нажмите кнопку добавить доску".to_string(),
            ]
        );
    }

    #[test]
    fn registry_discovers_json_files_and_applies_overrides() {
        let dir = dataset_dir();
        let mut extra = BTreeMap::new();
        extra.insert("Gitlab".to_string(), PathBuf::from("/srv/gitlab.json"));
        let registry = TopicRegistry::discover(dir.path(), &extra);
        assert_eq!(registry.names(), vec!["broken", "gitlab", "wekan"]);
        assert!(registry.contains("WEKAN"));
        assert_eq!(registry.path_for("GitLab"), Some(PathBuf::from("/srv/gitlab.json")));
        assert_eq!(registry.path_for("Jitsi"), Some(dir.path().join("jitsi.json")));
        assert_eq!(
            registry.path_for("Проектная деятельность"),
            Some(dir.path().join("проектная деятельность.json"))
        );
    }

    #[tokio::test]
    async fn topic_lookup_is_case_insensitive_and_cached() {
        let dir = dataset_dir();
        let store = CorpusStore::new(TopicRegistry::discover(dir.path(), &BTreeMap::new()));
        let first = store.get_sentences("Wekan").await.unwrap();
        std::fs::remove_file(dir.path().join("wekan.json")).unwrap();
        let second = store.get_sentences("wekan").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn names_that_leave_the_dataset_dir_do_not_resolve() {
        let registry = TopicRegistry::new("/srv/datasets");
        for name in ["../private", "a/b", "..", "/etc/passwd", "x\\y", "wekan.json", ""] {
            assert!(!is_topic_name(name), "{name:?}");
            assert_eq!(registry.path_for(name), None, "{name:?}");
        }
        assert!(is_topic_name("project-work 2"));
    }

    #[tokio::test]
    async fn topic_outside_dataset_dir_is_not_read() {
        let root = tempfile::tempdir().unwrap();
        let datasets = root.path().join("datasets");
        std::fs::create_dir(&datasets).unwrap();
        std::fs::write(root.path().join("private.json"), WEKAN).unwrap();
        let store = CorpusStore::new(TopicRegistry::new(&datasets));
        assert!(matches!(store.get_sentences("../private").await, Err(CorpusError::NotFound(_))));
    }

    #[tokio::test]
    async fn missing_topic_is_not_found() {
        let dir = dataset_dir();
        let store = CorpusStore::new(TopicRegistry::new(dir.path()));
        assert!(matches!(store.get_sentences("taiga").await, Err(CorpusError::NotFound(t)) if t == "taiga"));
    }

    #[tokio::test]
    async fn malformed_file_is_reported_and_retried() {
        let dir = dataset_dir();
        let store = CorpusStore::new(TopicRegistry::new(dir.path()));
        assert!(matches!(store.get_sentences("broken").await, Err(CorpusError::Malformed(..))));
        std::fs::write(dir.path().join("broken.json"), WEKAN).unwrap();
        assert_eq!(store.get_sentences("broken").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_first_access_shares_one_load() {
        let dir = dataset_dir();
        let store = Arc::new(CorpusStore::new(TopicRegistry::new(dir.path())));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get_sentences("wekan").await.unwrap() })
            })
            .collect();
        let mut loaded = Vec::new();
        for h in handles {
            loaded.push(h.await.unwrap());
        }
        assert!(loaded.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
