//! Project context assembly
//!
//! The project context is the text handed to the model as grounding: every
//! allow-listed workspace file rendered as `File: <path>\n<content>\n\n`, in
//! walk order. [`ContextStore`] owns the current value and rebuilds it from
//! scratch on demand.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::error::WorkspaceError;
use crate::workspace::{read_files, walk_async, FileRecord, WalkOptions};

/// Extensions included in the project context by default.
pub const SOURCE_EXTENSIONS: &[&str] = &[".js", ".py", ".java", ".cpp", ".ts", ".html", ".css"];

/// Suffix of `path` starting at its last `.`, or `None` when there is no `.`.
pub fn extension_of(path: &str) -> Option<&str> {
    path.rfind('.').map(|idx| &path[idx..])
}

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    extensions: Vec<String>,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(SOURCE_EXTENSIONS.iter().map(|s| s.to_string()).collect())
    }
}

impl ContextAssembler {
    pub fn new(extensions: Vec<String>) -> Self {
        Self { extensions }
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        extension_of(path).is_some_and(|ext| self.extensions.iter().any(|allowed| allowed == ext))
    }

    /// Concatenate allow-listed files. `contents[i]` belongs to `paths[i]`.
    pub fn assemble<C, P>(&self, contents: &[C], paths: &[P]) -> String
    where
        C: AsRef<str>,
        P: AsRef<str>,
    {
        debug_assert_eq!(contents.len(), paths.len());

        let mut context = String::new();
        for (content, path) in contents.iter().zip(paths) {
            let path = path.as_ref();
            if self.is_allowed(path) {
                context.push_str("File: ");
                context.push_str(path);
                context.push('\n');
                context.push_str(content.as_ref());
                context.push_str("\n\n");
            }
        }
        context
    }

    pub fn assemble_records(&self, records: &[FileRecord]) -> String {
        let contents: Vec<&str> = records.iter().map(|r| r.content.as_str()).collect();
        let paths: Vec<String> = records.iter().map(FileRecord::display_path).collect();
        self.assemble(&contents[..], &paths[..])
    }
}

/// Full scan of `roots`: walk, read, assemble. Roots contribute in order.
pub async fn build_project_context(
    roots: &[PathBuf],
    walk_options: &WalkOptions,
    assembler: &ContextAssembler,
) -> Result<String, WorkspaceError> {
    let mut context = String::new();

    for root in roots {
        let paths = walk_async(root.clone(), walk_options.clone()).await?;
        let records = read_files(&paths).await;
        log::debug!(
            "{}: {} paths walked, {} files read",
            root.display(),
            paths.len(),
            records.len()
        );
        context.push_str(&assembler.assemble_records(&records));
    }

    Ok(context)
}

/// Owner of the current project context.
///
/// Rebuilds run one at a time. A trigger that arrives while a rebuild is
/// running waits for it and is satisfied by the next rebuild to start, so a
/// burst of triggers costs at most two scans.
pub struct ContextStore {
    roots: Vec<PathBuf>,
    walk_options: WalkOptions,
    assembler: ContextAssembler,
    current: RwLock<Arc<str>>,
    requested: AtomicU64,
    // Highest request number covered by a completed rebuild
    completed: Mutex<u64>,
    #[cfg(test)]
    scans: std::sync::atomic::AtomicUsize,
}

impl ContextStore {
    pub fn new(roots: Vec<PathBuf>, walk_options: WalkOptions, assembler: ContextAssembler) -> Self {
        Self {
            roots,
            walk_options,
            assembler,
            current: RwLock::new(Arc::from("")),
            requested: AtomicU64::new(0),
            completed: Mutex::new(0),
            #[cfg(test)]
            scans: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn walk_options(&self) -> &WalkOptions {
        &self.walk_options
    }

    /// The last fully built context. Empty until the first rebuild completes.
    pub async fn current(&self) -> Arc<str> {
        self.current.read().await.clone()
    }

    /// Rescan every root and replace the context.
    ///
    /// On failure the previous context stays in place.
    pub async fn rebuild(&self) -> Result<Arc<str>, WorkspaceError> {
        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let mut completed = self.completed.lock().await;

        if *completed >= ticket {
            return Ok(self.current().await);
        }

        // Everything requested up to here is covered by a scan starting now
        let covers = self.requested.load(Ordering::SeqCst);
        #[cfg(test)]
        self.scans.fetch_add(1, Ordering::SeqCst);
        let context: Arc<str> = Arc::from(
            build_project_context(&self.roots, &self.walk_options, &self.assembler).await?,
        );

        *self.current.write().await = context.clone();
        *completed = covers;
        log::info!("Project context rebuilt ({} bytes)", context.len());

        Ok(context)
    }

    #[cfg(test)]
    pub(crate) fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}
