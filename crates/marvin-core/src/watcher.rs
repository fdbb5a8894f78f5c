//! File-system watcher that keeps the project context current.
//!
//! Wraps a `notify` watcher on each workspace root. Relevant changes trigger
//! a full [`ContextStore::rebuild`]; events that pile up while a rebuild runs
//! are folded into the next one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::ContextStore;
use crate::workspace::walker::is_ignored;

/// Keeps watching until dropped.
pub struct ContextWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for ContextWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start watching every root of `store`.
pub fn watch(store: Arc<ContextStore>) -> notify::Result<ContextWatcher> {
    let (tx, rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.send(res);
    })?;

    let roots: Vec<PathBuf> = store
        .roots()
        .iter()
        .map(|root| root.canonicalize().unwrap_or_else(|_| root.clone()))
        .collect();
    for root in &roots {
        watcher.watch(root, RecursiveMode::Recursive)?;
        log::info!("Watching {}", root.display());
    }

    let task = tokio::spawn(rebuild_on_changes(store, rx, roots));

    Ok(ContextWatcher {
        _watcher: watcher,
        task,
    })
}

/// Rebuild `store` for each batch of relevant events until `rx` closes.
async fn rebuild_on_changes(
    store: Arc<ContextStore>,
    mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    roots: Vec<PathBuf>,
) {
    let ignored_names = store.walk_options().ignored_names.clone();

    while let Some(res) = rx.recv().await {
        let mut dirty = is_relevant(&res, &roots, &ignored_names);

        // Fold everything already queued into this rebuild
        while let Ok(res) = rx.try_recv() {
            dirty |= is_relevant(&res, &roots, &ignored_names);
        }

        if !dirty {
            continue;
        }

        if let Err(err) = store.rebuild().await {
            log::error!("Context rebuild after file change failed: {}", err);
        }
    }
}

fn is_relevant(res: &notify::Result<Event>, roots: &[PathBuf], ignored_names: &[String]) -> bool {
    let event = match res {
        Ok(event) => event,
        Err(err) => {
            log::warn!("File watcher error: {}", err);
            return false;
        }
    };

    let changes_content = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );

    changes_content && event.paths.iter().any(|path| !is_ignored_change(path, roots, ignored_names))
}

fn is_ignored_change(path: &Path, roots: &[PathBuf], ignored_names: &[String]) -> bool {
    roots
        .iter()
        .find_map(|root| path.strip_prefix(root).ok())
        .is_some_and(|relative| is_ignored(relative, ignored_names))
}
