//! Workspace scanning: directory walking and file loading.

pub mod loader;
pub mod walker;

pub use loader::{read_file, read_files, FileRecord};
pub use walker::{walk, walk_async, WalkOptions};
