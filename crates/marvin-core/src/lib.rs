pub mod ai;
pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod orchestrator;
pub mod session;
pub mod state;
pub mod watcher;
pub mod workspace;

// Re-export main types for convenience
pub use ai::{CancellationHandle, ChatClient, ChatStream, UnexpectedRolePolicy};
pub use config::Config;
pub use context::{ContextAssembler, ContextStore};
pub use error::{AskError, ChatError, HistoryError, WorkspaceError};
pub use history::{History, HistoryEntry, HistoryStore};
pub use orchestrator::{Orchestrator, QueryState};
pub use session::Session;
pub use state::{ChatMessage, ChatRole};
pub use workspace::{FileRecord, WalkOptions};
