//! Offline dataset work: turning rated feedback and CSV tables into corpus
//! files, merging corpora and splitting datasets for evaluation.

use std::fs;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::corpus::{read_corpus, Answer, CorpusData, CorpusDocument, CorpusError, Paragraph, Qa};
use crate::feedback::{FeedbackRecord, Label};

pub const DATASET_TITLE: &str = "Custom QA Dataset";
pub const DATASET_VERSION: &str = "1.0";

/// Builds a corpus from feedback records, one paragraph per record.
/// With `label` set, only records carrying that label are kept.
pub fn feedback_to_corpus(records: &[FeedbackRecord], label: Option<Label>) -> CorpusDocument {
    let paragraphs = records
        .iter()
        .filter(|r| label.map_or(true, |l| r.label == l))
        .map(|r| Paragraph {
            context: r.context.clone(),
            qas: r
                .qas
                .iter()
                .map(|qa| Qa {
                    id: Some(qa.id.into()),
                    question: qa.question.clone(),
                    answers: qa
                        .answers
                        .iter()
                        .map(|a| Answer {
                            text: a.text.clone(),
                            answer_start: 0,
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();
    single_section(paragraphs, Some(DATASET_VERSION.to_string()))
}

fn single_section(paragraphs: Vec<Paragraph>, version: Option<String>) -> CorpusDocument {
    CorpusDocument {
        data: vec![CorpusData {
            title: DATASET_TITLE.to_string(),
            paragraphs,
        }],
        version,
    }
}

/// One row of a question/answer table. Extra columns are ignored.
#[derive(Debug, Deserialize)]
struct CsvRow {
    question: String,
    answer: String,
}

/// Builds a corpus from CSV with `question` and `answer` header columns.
/// Each row becomes a paragraph whose context is the answer; the row index is the QA id.
pub fn csv_to_corpus<R: Read>(reader: R) -> Result<CorpusDocument, DatasetError> {
    let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut paragraphs = Vec::new();
    for (index, row) in csv.deserialize::<CsvRow>().enumerate() {
        let row = row.map_err(DatasetError::Csv)?;
        paragraphs.push(Paragraph {
            context: row.answer.clone(),
            qas: vec![Qa {
                id: Some(index.to_string().into()),
                question: row.question,
                answers: vec![Answer {
                    text: row.answer,
                    answer_start: 0,
                }],
            }],
        });
    }
    Ok(single_section(paragraphs, Some(DATASET_VERSION.to_string())))
}

pub fn read_csv_corpus(path: &Path) -> Result<CorpusDocument, DatasetError> {
    let file = fs::File::open(path).map_err(|e| DatasetError::Read(path.to_path_buf(), e))?;
    csv_to_corpus(file)
}

/// Concatenates the paragraphs of every document, in order, into one section.
pub fn merge_corpora(docs: &[CorpusDocument]) -> CorpusDocument {
    let paragraphs = docs
        .iter()
        .flat_map(|doc| doc.data.iter())
        .flat_map(|data| data.paragraphs.iter().cloned())
        .collect();
    let version = docs
        .iter()
        .find_map(|doc| doc.version.clone())
        .or_else(|| Some(DATASET_VERSION.to_string()));
    single_section(paragraphs, version)
}

/// Merges every `*.json` corpus directly inside `dir`, sorted by file name.
pub fn merge_corpus_dir(dir: &Path) -> Result<CorpusDocument, DatasetError> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| DatasetError::Read(dir.to_path_buf(), e.into()))?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|e| e == "json") {
            paths.push(path.to_path_buf());
        }
    }
    paths.sort();
    tracing::debug!(dir = %dir.display(), files = paths.len(), "merging corpora");
    let docs = paths.iter().map(|p| read_corpus(p)).collect::<Result<Vec<_>, _>>()?;
    Ok(merge_corpora(&docs))
}

/// Shuffles `items` and splits them; the first part holds `floor(len * ratio)` items.
pub fn split_train_test<T>(mut items: Vec<T>, ratio: f64, rng: &mut impl Rng) -> (Vec<T>, Vec<T>) {
    items.shuffle(rng);
    let train = ((items.len() as f64) * ratio.clamp(0.0, 1.0)).floor() as usize;
    let test = items.split_off(train);
    (items, test)
}

/// Splits a corpus by paragraph into train and test documents.
pub fn split_corpus(doc: &CorpusDocument, ratio: f64, rng: &mut impl Rng) -> (CorpusDocument, CorpusDocument) {
    let paragraphs: Vec<Paragraph> = doc.data.iter().flat_map(|d| d.paragraphs.clone()).collect();
    let (train, test) = split_train_test(paragraphs, ratio, rng);
    (
        single_section(train, doc.version.clone()),
        single_section(test, doc.version.clone()),
    )
}

/// Writes a corpus as pretty JSON. The file is replaced atomically.
pub fn write_corpus(path: &Path, doc: &CorpusDocument) -> Result<(), DatasetError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| DatasetError::Write(path.to_path_buf(), e))?;

    let temp = NamedTempFile::new_in(parent).map_err(|e| DatasetError::Write(path.to_path_buf(), e))?;
    {
        let mut writer = BufWriter::new(&temp);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"  ");
        let mut ser = serde_json::Serializer::with_formatter(&mut writer, formatter);
        doc.serialize(&mut ser).map_err(DatasetError::Serialize)?;
        writer.flush().map_err(|e| DatasetError::Write(path.to_path_buf(), e))?;
    }
    temp.persist(path).map_err(|e| DatasetError::Write(path.to_path_buf(), e.error))?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("failed to serialize dataset: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("invalid csv: {0}")]
    Csv(csv::Error),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
}
