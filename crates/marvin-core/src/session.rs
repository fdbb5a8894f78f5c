//! Entry point for front ends.
//!
//! A [`Session`] ties the project context, the orchestrator and the history
//! file together. Front ends hold it (usually in an `Arc`) and call the
//! methods below; nothing here is global.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::ai::ChatClient;
use crate::config::Config;
use crate::context::{ContextAssembler, ContextStore};
use crate::error::{AskError, WorkspaceError};
use crate::history::{HistoryEntry, HistoryStore};
use crate::orchestrator::{Orchestrator, QueryState};
use crate::workspace::WalkOptions;

pub struct Session {
    context: Arc<ContextStore>,
    orchestrator: Orchestrator,
    history_store: Option<HistoryStore>,
}

impl Session {
    pub fn new(context: Arc<ContextStore>, orchestrator: Orchestrator, history_store: Option<HistoryStore>) -> Self {
        Self {
            context,
            orchestrator,
            history_store,
        }
    }

    /// Build a session from stored settings, load history and scan `roots`.
    pub async fn open(config: &Config, roots: Vec<PathBuf>) -> Result<Self> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| anyhow!("No API key configured. Set OPENAI_API_KEY or run `marvin config --api-key <key>`"))?;
        let client = ChatClient::from_config(config, &api_key);

        let history_store = HistoryStore::new(Config::history_path()?);
        let history = match history_store.load().await {
            Ok(history) => history,
            Err(err) => {
                log::warn!("Could not load history from {}: {}", history_store.path().display(), err);
                Default::default()
            }
        };

        let walk_options = WalkOptions::default().with_ignored_names(config.ignored_names.clone());
        let assembler = ContextAssembler::new(config.extensions.clone());
        let context = Arc::new(ContextStore::new(roots, walk_options, assembler));

        let session = Self::new(context, Orchestrator::new(client, history), Some(history_store));
        session.trigger_context_rebuild().await?;
        Ok(session)
    }

    pub fn context_store(&self) -> Arc<ContextStore> {
        self.context.clone()
    }

    pub async fn context(&self) -> Arc<str> {
        self.context.current().await
    }

    pub async fn trigger_context_rebuild(&self) -> Result<(), WorkspaceError> {
        self.context.rebuild().await.map(|_| ())
    }

    pub fn state(&self) -> QueryState {
        self.orchestrator.state()
    }

    pub async fn ask(&self, question: &str) -> Result<String, AskError> {
        let context = self.context.current().await;
        let answer = self.orchestrator.ask(question, &context).await?;
        self.persist_history().await;
        Ok(answer)
    }

    pub async fn ask_streaming<F>(&self, question: &str, on_fragment: F) -> Result<String, AskError>
    where
        F: FnMut(&str),
    {
        let context = self.context.current().await;
        let answer = self.orchestrator.ask_streaming(question, &context, on_fragment).await?;
        self.persist_history().await;
        Ok(answer)
    }

    pub fn cancel_current_query(&self) -> bool {
        self.orchestrator.cancel_current()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.orchestrator.history()
    }

    pub async fn clear_history(&self) {
        self.orchestrator.clear_history();
        self.persist_history().await;
    }

    // A failed write never fails the query that produced the entry
    async fn persist_history(&self) {
        let Some(store) = &self.history_store else {
            return;
        };

        if let Err(err) = store.save(&self.orchestrator.history_snapshot()).await {
            log::warn!("Could not save history to {}: {}", store.path().display(), err);
        }
    }
}
