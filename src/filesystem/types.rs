//! Common types for file system adaptors

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::SystemTime;

/// File/directory metadata across all file system adaptors
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metadata {
    /// Size in bytes (0 for directories)
    pub size: u64,

    pub is_file: bool,

    pub is_dir: bool,

    pub is_symlink: bool,

    /// Last modification time
    pub modified: Option<DateTime<Utc>>,

    /// Last access time
    pub accessed: Option<DateTime<Utc>>,

    /// Unix permission bits
    pub permissions: Option<u32>,
}

impl Metadata {
    /// Create metadata for a file
    pub fn file(size: u64) -> Self {
        Self::with_kind(size, true, false, false)
    }

    /// Create metadata for a directory
    pub fn directory() -> Self {
        Self::with_kind(0, false, true, false)
    }

    /// Create metadata for a symlink
    pub fn symlink(target_size: u64) -> Self {
        Self::with_kind(target_size, false, false, true)
    }

    fn with_kind(size: u64, is_file: bool, is_dir: bool, is_symlink: bool) -> Self {
        Self {
            size,
            is_file,
            is_dir,
            is_symlink,
            modified: None,
            accessed: None,
            permissions: None,
        }
    }

    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = Some(DateTime::<Utc>::from(modified));
        self
    }

    pub fn with_accessed(mut self, accessed: SystemTime) -> Self {
        self.accessed = Some(DateTime::<Utc>::from(accessed));
        self
    }

    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = Some(permissions);
        self
    }
}

/// Directory entry from listing operations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirEntry {
    /// Path relative to the listed directory
    pub path: PathBuf,

    /// Path as the file system knows it
    pub full_path: PathBuf,

    pub metadata: Metadata,
}

impl DirEntry {
    pub fn new(path: PathBuf, full_path: PathBuf, metadata: Metadata) -> Self {
        Self {
            path,
            full_path,
            metadata,
        }
    }

    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.path.file_name()
    }

    pub fn is_file(&self) -> bool {
        self.metadata.is_file
    }

    pub fn is_dir(&self) -> bool {
        self.metadata.is_dir
    }
}

/// Async stream of file contents
pub type ReadStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Options for list operations
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// List recursively into subdirectories
    pub recursive: bool,

    /// Maximum depth for recursive listing (None = unlimited)
    pub max_depth: Option<usize>,

    /// Include hidden files (starting with .)
    pub include_hidden: bool,

    /// Maximum number of entries to return (None = unlimited)
    pub max_entries: Option<usize>,
}

impl ListOptions {
    /// Direct children only
    pub fn shallow() -> Self {
        Self::default()
    }

    pub fn recursive() -> Self {
        Self {
            recursive: true,
            ..Default::default()
        }
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn include_hidden(mut self) -> Self {
        self.include_hidden = true;
        self
    }

    pub(crate) fn is_full(&self, count: usize) -> bool {
        self.max_entries.is_some_and(|max| count >= max)
    }

    pub(crate) fn is_too_deep(&self, depth: usize) -> bool {
        if !self.recursive && depth > 0 {
            return true;
        }
        self.max_depth.is_some_and(|max| depth >= max)
    }

    pub(crate) fn skips(&self, name: &str) -> bool {
        !self.include_hidden && name.starts_with('.')
    }
}

/// Options for write operations
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Create parent directories if they don't exist
    pub create_parents: bool,

    /// Overwrite an existing file
    pub overwrite: bool,

    /// Unix permission bits for the new file
    pub permissions: Option<u32>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            create_parents: true,
            overwrite: true,
            permissions: None,
        }
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn no_overwrite(mut self) -> Self {
        self.overwrite = false;
        self
    }
}
