//! Error types for the context pipeline and the chat client

use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    /// A single file could not be read. Callers scanning a workspace log and skip it.
    #[error("failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A directory could not be listed. Aborts the walk of the enclosing root.
    #[error("failed to read directory {path}: {source}")]
    DirectoryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("workspace scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: StatusCode, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Unexpected message role in response: {0}")]
    UnexpectedRole(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ChatError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }
}

/// Outcome of a failed query, as seen by the front end.
#[derive(Error, Debug)]
pub enum AskError {
    #[error("query cancelled")]
    Cancelled,

    #[error("another query is already in progress")]
    Busy,

    #[error("query failed: {0}")]
    Failed(ChatError),
}

impl From<ChatError> for AskError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Cancelled => AskError::Cancelled,
            other => AskError::Failed(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
