//! Spelling normalization: rewrites known misspellings to their canonical form.
//!
//! Each word is lower-cased, reduced to a normal form by a [Lemmatizer] and
//! looked up in a reverse index of the [CorrectionDictionary]. Everything that
//! is not a word (spaces, punctuation) passes through untouched.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w+\b").expect("static regex"));

/// Canonical spelling -> known misspellings of it. Immutable once loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrectionDictionary(BTreeMap<String, Vec<String>>);

impl CorrectionDictionary {
    pub fn new(entries: BTreeMap<String, Vec<String>>) -> Self {
        Self(entries)
    }

    pub fn from_json(s: &str) -> Result<Self, SpellingError> {
        serde_json::from_str(s).map_err(SpellingError::Parse)
    }

    pub fn load(path: &Path) -> Result<Self, SpellingError> {
        let s = std::fs::read_to_string(path).map_err(|e| SpellingError::Read(path.to_path_buf(), e))?;
        Self::from_json(&s)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every variant (lower-cased) mapped to its canonical form.
    fn reverse_index(&self) -> HashMap<String, String> {
        let mut index = HashMap::new();
        for (canonical, variants) in &self.0 {
            for variant in variants {
                index.insert(variant.to_lowercase(), canonical.clone());
            }
        }
        index
    }
}

/// Reduces an already lower-cased word to its normal (dictionary) form.
pub trait Lemmatizer: Send + Sync {
    fn normal_form(&self, word: &str) -> String;
}

/// Treats every word as its own normal form.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowercaseLemmatizer;

impl Lemmatizer for LowercaseLemmatizer {
    fn normal_form(&self, word: &str) -> String {
        word.to_string()
    }
}

/// Strips the longest known inflectional ending, keeping at least `min_stem` characters.
#[derive(Debug, Clone)]
pub struct SuffixLemmatizer {
    /// Sorted longest first.
    suffixes: Vec<String>,
    min_stem: usize,
}

const RUSSIAN_ENDINGS: &[&str] = &[
    "ами", "ями", "ого", "его", "ому", "ему", "ыми", "ими", "ой", "ей", "ом", "ем", "ам", "ям", "ах",
    "ях", "ов", "ев", "а", "я", "у", "ю", "е", "ы", "и",
];

impl SuffixLemmatizer {
    pub fn new<S: Into<String>>(suffixes: impl IntoIterator<Item = S>, min_stem: usize) -> Self {
        let mut suffixes: Vec<String> = suffixes.into_iter().map(Into::into).collect();
        suffixes.sort_by_key(|s| std::cmp::Reverse(s.chars().count()));
        Self { suffixes, min_stem }
    }

    /// Common Russian noun and adjective case endings.
    pub fn russian() -> Self {
        Self::new(RUSSIAN_ENDINGS.iter().copied(), 3)
    }
}

impl Lemmatizer for SuffixLemmatizer {
    fn normal_form(&self, word: &str) -> String {
        let len = word.chars().count();
        for suffix in &self.suffixes {
            if let Some(stem) = word.strip_suffix(suffix.as_str()) {
                if len - suffix.chars().count() >= self.min_stem {
                    return stem.to_string();
                }
            }
        }
        word.to_string()
    }
}

/// Which built-in [Lemmatizer] to use; selected in config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LemmatizerKind {
    Lowercase,
    #[default]
    Suffix,
}

impl LemmatizerKind {
    pub fn build(self) -> Arc<dyn Lemmatizer> {
        match self {
            LemmatizerKind::Lowercase => Arc::new(LowercaseLemmatizer),
            LemmatizerKind::Suffix => Arc::new(SuffixLemmatizer::russian()),
        }
    }
}

/// Spelling normalizer with its reverse index built once.
#[derive(Clone)]
pub struct Normalizer {
    reverse: HashMap<String, String>,
    lemmatizer: Arc<dyn Lemmatizer>,
}

impl std::fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Normalizer").field("variants", &self.reverse.len()).finish()
    }
}

impl Normalizer {
    pub fn new(dictionary: &CorrectionDictionary, lemmatizer: Arc<dyn Lemmatizer>) -> Self {
        Self {
            reverse: dictionary.reverse_index(),
            lemmatizer,
        }
    }

    /// Replaces every word whose normal form is a known misspelling.
    /// Unknown words keep their original spelling and case.
    pub fn normalize(&self, text: &str) -> String {
        WORD.replace_all(text, |caps: &Captures| {
            let token = &caps[0];
            let word = token.to_lowercase();
            let root = self.lemmatizer.normal_form(&word);
            match self.reverse.get(&root).or_else(|| self.reverse.get(&word)) {
                Some(canonical) => canonical.clone(),
                None => token.to_string(),
            }
        })
        .into_owned()
    }
}

/// One-shot form of [Normalizer::normalize]; builds the reverse index on every call.
pub fn normalize(text: &str, dictionary: &CorrectionDictionary, lemmatizer: Arc<dyn Lemmatizer>) -> String {
    Normalizer::new(dictionary, lemmatizer).normalize(text)
}

#[derive(Debug, thiserror::Error)]
pub enum SpellingError {
    #[error("failed to read dictionary {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("invalid dictionary: {0}")]
    Parse(serde_json::Error),
}
