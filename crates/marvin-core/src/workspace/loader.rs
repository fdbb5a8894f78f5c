use std::path::{Path, PathBuf};

use crate::error::WorkspaceError;

/// One successfully read workspace file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub content: String,
}

impl FileRecord {
    /// The path as it appears in the project context.
    pub fn display_path(&self) -> String {
        self.path.display().to_string()
    }
}

/// Read a file as UTF-8 text.
pub async fn read_file(path: &Path) -> Result<FileRecord, WorkspaceError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| WorkspaceError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(FileRecord {
        path: path.to_path_buf(),
        content,
    })
}

/// Read every path in order. Unreadable files are logged and left out.
pub async fn read_files(paths: &[PathBuf]) -> Vec<FileRecord> {
    let mut records = Vec::with_capacity(paths.len());

    for path in paths {
        match read_file(path).await {
            Ok(record) => records.push(record),
            Err(err) => log::warn!("{}", err),
        }
    }

    records
}
