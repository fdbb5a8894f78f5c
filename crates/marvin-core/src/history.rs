//! Question/answer history
//!
//! Newest entries first, capped at [`HISTORY_LIMIT`]. [`HistoryStore`]
//! persists the list as a JSON array and is rewritten after every answered
//! query.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::HistoryError;

pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub question: String,
    pub response: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the first [`HISTORY_LIMIT`] entries, which are the newest.
    pub fn from_entries(mut entries: Vec<HistoryEntry>) -> Self {
        entries.truncate(HISTORY_LIMIT);
        Self { entries }
    }

    pub fn record(&mut self, question: impl Into<String>, response: impl Into<String>) {
        self.entries.insert(
            0,
            HistoryEntry {
                question: question.into(),
                response: response.into(),
            },
        );
        self.entries.truncate(HISTORY_LIMIT);
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// JSON file holding the persisted history.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means no history yet.
    pub async fn load(&self) -> Result<History, HistoryError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(History::new()),
            Err(err) => return Err(err.into()),
        };
        let entries: Vec<HistoryEntry> = serde_json::from_str(&contents)?;
        Ok(History::from_entries(entries))
    }

    pub async fn save(&self, history: &History) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let contents = serde_json::to_string_pretty(history.entries())?;
        fs::write(&self.path, contents).await?;
        Ok(())
    }
}
