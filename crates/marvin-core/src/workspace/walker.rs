use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::WorkspaceError;

/// Directory names skipped at any depth below a root.
pub const DEFAULT_IGNORED_NAMES: &[&str] = &["node_modules", "dist", "out", "build", ".git", "bin", "obj"];

#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub ignored_names: Vec<String>,
    /// Descend into symlinked directories. Each real directory is still visited once.
    pub follow_links: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            ignored_names: DEFAULT_IGNORED_NAMES.iter().map(|s| s.to_string()).collect(),
            follow_links: true,
        }
    }
}

impl WalkOptions {
    pub fn with_ignored_names(mut self, names: Vec<String>) -> Self {
        self.ignored_names = names;
        self
    }

    pub fn with_follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    fn ignores(&self, name: &OsStr) -> bool {
        self.ignored_names.iter().any(|ignored| name == OsStr::new(ignored))
    }
}

/// True when any segment of `relative` exactly matches an ignored name.
pub fn is_ignored(relative: &Path, ignored_names: &[String]) -> bool {
    relative
        .components()
        .any(|c| ignored_names.iter().any(|ignored| c.as_os_str() == OsStr::new(ignored)))
}

/// List every non-directory path below `root`, skipping ignored names.
///
/// Returned paths are absolute. Order follows the directory listing and is
/// not sorted. An unreadable directory aborts the whole walk.
pub fn walk(root: &Path, options: &WalkOptions) -> Result<Vec<PathBuf>, WorkspaceError> {
    let root = root.canonicalize().map_err(|source| WorkspaceError::DirectoryRead {
        path: root.to_path_buf(),
        source,
    })?;

    let mut visited: HashSet<PathBuf> = HashSet::new();
    let mut files = Vec::new();

    let entries = WalkDir::new(&root)
        .follow_links(options.follow_links)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() > 0 && options.ignores(entry.file_name()) {
                return false;
            }
            if entry.file_type().is_dir() {
                // Only descend into a real directory once
                if let Ok(real) = fs::canonicalize(entry.path()) {
                    return visited.insert(real);
                }
            }
            true
        });

    for entry in entries {
        match entry {
            Ok(entry) => {
                if !entry.file_type().is_dir() {
                    files.push(entry.into_path());
                }
            }
            Err(err) => {
                if let Some(ancestor) = err.loop_ancestor() {
                    log::debug!("Skipping symlink loop back to {}", ancestor.display());
                    continue;
                }

                let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());

                // A dangling symlink is handed to the loader like any other file
                if is_symlink(&path) {
                    files.push(path);
                    continue;
                }

                return Err(WorkspaceError::DirectoryRead {
                    path,
                    source: err.into(),
                });
            }
        }
    }

    log::debug!("Walked {}: {} files", root.display(), files.len());
    Ok(files)
}

/// [`walk`] on the blocking thread pool.
pub async fn walk_async(root: PathBuf, options: WalkOptions) -> Result<Vec<PathBuf>, WorkspaceError> {
    tokio::task::spawn_blocking(move || walk(&root, &options)).await?
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}
