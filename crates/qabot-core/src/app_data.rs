//! Where qabot stores its own data (config, feedback log, datasets).
//!
//! Topic corpora may live anywhere; the config points at them. We only default
//! to paths under this directory.

use std::path::PathBuf;

/// Default name of the feedback log inside the app data directory.
pub const FEEDBACK_FILENAME: &str = "feedback.json";
/// Default name of the correction dictionary inside the app data directory.
pub const DICTIONARY_FILENAME: &str = "dictionary.json";
/// Default dataset directory (one `<topic>.json` per topic).
pub const DATASETS_DIRNAME: &str = "datasets";

/// Returns the directory where qabot stores config, feedback and datasets.
/// On Linux: `~/.local/share/qabot/`.
/// Creates the directory if it doesn't exist; returns `None` if we can't determine the path.
pub fn app_data_dir() -> Option<PathBuf> {
    let dir = directories::ProjectDirs::from("app", "Qabot", "qabot")?.data_local_dir().to_path_buf();
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

/// `<app data>/<name>`, or `./<name>` when no app data directory is available.
pub(crate) fn data_path(name: &str) -> PathBuf {
    app_data_dir().map(|d| d.join(name)).unwrap_or_else(|| PathBuf::from(name))
}
