//! Persisted config (model, dataset locations, topic registry) in the app data directory.
//!
//! Precedence, lowest first: built-in defaults, `config.toml`, environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app_data::{self, DATASETS_DIRNAME, DICTIONARY_FILENAME, FEEDBACK_FILENAME};
use crate::corpus::is_topic_name;
use crate::ollama::{DEFAULT_BASE_URL, DEFAULT_EMBED_MODEL};
use crate::retrieval::DEFAULT_THRESHOLD;
use crate::spelling::LemmatizerKind;

const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chat transport credential. Not used by the core; handed through to the transport.
    pub telegram_key: Option<String>,
    pub ollama_url: String,
    pub embed_model: String,
    /// Directory holding `<topic>.json` corpus files.
    pub dataset_dir: PathBuf,
    /// JSON map of canonical spelling -> known misspellings.
    pub dictionary_path: PathBuf,
    /// Append-only feedback log.
    pub feedback_path: PathBuf,
    /// Morphological normal form used before dictionary lookup.
    pub lemmatizer: LemmatizerKind,
    /// Minimum cosine similarity for an answer to be returned instead of the fallback.
    pub threshold: f32,
    /// Upper bound on one retrieval; 0 disables the bound.
    pub retrieval_timeout_secs: u64,
    /// Extra topics (name -> corpus file). Overrides files discovered in `dataset_dir`.
    pub topics: BTreeMap<String, PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram_key: None,
            ollama_url: DEFAULT_BASE_URL.to_string(),
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
            dataset_dir: app_data::data_path(DATASETS_DIRNAME),
            dictionary_path: app_data::data_path(DICTIONARY_FILENAME),
            feedback_path: app_data::data_path(FEEDBACK_FILENAME),
            lemmatizer: LemmatizerKind::default(),
            threshold: DEFAULT_THRESHOLD,
            retrieval_timeout_secs: 30,
            topics: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn retrieval_timeout(&self) -> Option<Duration> {
        (self.retrieval_timeout_secs > 0).then(|| Duration::from_secs(self.retrieval_timeout_secs))
    }

    /// Applies `TELEGRAM_KEY` and `QABOT_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Registers a corpus file for a topic, replacing any earlier entry.
    pub fn set_topic(&mut self, topic: &str, path: PathBuf) -> Result<(), ConfigError> {
        let topic = topic.trim().to_lowercase();
        if !is_topic_name(&topic) {
            return Err(ConfigError::InvalidTopic(topic));
        }
        self.topics.insert(topic, path);
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = var("TELEGRAM_KEY") {
            self.telegram_key = Some(v);
        }
        if let Some(v) = var("QABOT_OLLAMA_URL") {
            self.ollama_url = v;
        }
        if let Some(v) = var("QABOT_EMBED_MODEL") {
            self.embed_model = v;
        }
        if let Some(v) = var("QABOT_DATASET_DIR") {
            self.dataset_dir = PathBuf::from(v);
        }
    }
}

/// Load config from the app data directory, then apply environment overrides.
/// Falls back to defaults if the file is missing or invalid.
pub fn load_config() -> Config {
    let mut config = load_saved_config();
    config.apply_env();
    config
}

/// The config file as saved, without environment overrides.
fn load_saved_config() -> Config {
    config_path().and_then(|path| load_config_from(&path).ok()).unwrap_or_default()
}

/// `<app data>/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    app_data::app_data_dir().map(|dir| dir.join(CONFIG_FILENAME))
}

/// Load config from an explicit file. Environment overrides are not applied.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    toml::from_str(&s).map_err(ConfigError::Parse)
}

/// Save config to the app data directory.
pub fn save_config(config: &Config) -> Result<(), ConfigError> {
    let path = config_path().ok_or(ConfigError::NoDataDir)?;
    save_config_to(&path, config)
}

pub fn save_config_to(path: &Path, config: &Config) -> Result<(), ConfigError> {
    std::fs::write(path, config.to_toml()?).map_err(ConfigError::Write)
}

/// Add or replace a topic corpus in the saved config.
pub fn set_topic_path(topic: &str, path: PathBuf) -> Result<(), ConfigError> {
    let mut config = load_saved_config();
    config.set_topic(topic, path)?;
    save_config(&config)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine app data directory")]
    NoDataDir,
    #[error("failed to read config {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("failed to write config: {0}")]
    Write(std::io::Error),
    #[error("invalid topic name {0:?}")]
    InvalidTopic(String),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "threshold = 0.7\nlemmatizer = \"lowercase\"\n\n[topics]\nwekan = \"/srv/data/wekan.json\"\n",
        )
        .unwrap();
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.threshold, 0.7);
        assert_eq!(config.embed_model, DEFAULT_EMBED_MODEL);
        assert_eq!(config.lemmatizer, LemmatizerKind::Lowercase);
        assert_eq!(config.topics["wekan"], PathBuf::from("/srv/data/wekan.json"));
    }

    #[test]
    fn invalid_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "threshold = \"high\"").unwrap();
        assert!(matches!(load_config_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn env_overrides_win_and_blank_values_are_ignored() {
        let env: HashMap<&str, &str> = [
            ("TELEGRAM_KEY", "123:abc"),
            ("QABOT_EMBED_MODEL", "nomic-embed-text"),
            ("QABOT_OLLAMA_URL", "  "),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.telegram_key.as_deref(), Some("123:abc"));
        assert_eq!(config.embed_model, "nomic-embed-text");
        assert_eq!(config.ollama_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn zero_timeout_disables_bound() {
        let config = Config { retrieval_timeout_secs: 0, ..Config::default() };
        assert!(config.retrieval_timeout().is_none());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config { threshold: 0.65, ..Config::default() };
        config.set_topic(" Boards ", dir.path().join("boards.json")).unwrap();
        save_config_to(&path, &config).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.threshold, 0.65);
        assert_eq!(loaded.topics["boards"], dir.path().join("boards.json"));
        assert_eq!(loaded.to_toml().unwrap(), config.to_toml().unwrap());
    }

    #[test]
    fn topic_names_with_separators_are_rejected() {
        let mut config = Config::default();
        for name in ["../x", "a/b", ""] {
            let err = config.set_topic(name, PathBuf::from("/tmp/x.json")).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidTopic(_)), "{name:?}");
        }
        assert!(config.topics.is_empty());
    }
}
