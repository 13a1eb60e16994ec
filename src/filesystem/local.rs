//! Local file system adaptor
//!
//! Async access to the local disk using Tokio's file I/O. A location other
//! than `/` roots the file system at that directory.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::types::{DirEntry, ListOptions, Metadata, ReadStream, WriteOptions};
use super::{already_exists, not_found, FileSystem};
use crate::credential::Credential;
use crate::error::{Result, XenonError};
use crate::properties::{Properties, PropertyDescription, PropertyType};
use crate::registry::{AdaptorDescriptor, FileAdaptor};

pub const NAME: &str = "file";

/// Size of the chunks `read` yields
pub const READ_CHUNK: &str = "file.read_chunk";

static PROPERTIES: &[PropertyDescription] = &[PropertyDescription::new(
    READ_CHUNK,
    PropertyType::Size,
    Some("64K"),
    "Size of the chunks a read yields",
)];

pub static DESCRIPTOR: AdaptorDescriptor = AdaptorDescriptor {
    name: NAME,
    description: "Files on the local disk",
    schemes: &["file"],
    location_patterns: &["", "/", "/path/to/root"],
    properties: PROPERTIES,
};

/// Local file system session
#[derive(Debug)]
pub struct LocalFileSystem {
    location: String,
    root: Option<PathBuf>,
    chunk_size: usize,
    open: AtomicBool,
}

impl LocalFileSystem {
    /// Unrooted file system with default properties
    pub fn new() -> Self {
        Self {
            location: "/".to_string(),
            root: None,
            chunk_size: 64 * 1024,
            open: AtomicBool::new(true),
        }
    }

    /// File system rooted at `root`; absolute paths resolve below it
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        Self {
            location: root.display().to_string(),
            root: Some(root),
            ..Self::new()
        }
    }

    fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path.strip_prefix("/").unwrap_or(path)),
            None => path.to_path_buf(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(XenonError::closed(NAME, "file system"))
        }
    }

    fn convert_metadata(meta: &std::fs::Metadata) -> Metadata {
        let mut metadata = if meta.is_file() {
            Metadata::file(meta.len())
        } else if meta.is_dir() {
            Metadata::directory()
        } else {
            Metadata::symlink(meta.len())
        };

        if let Ok(modified) = meta.modified() {
            metadata = metadata.with_modified(modified);
        }
        if let Ok(accessed) = meta.accessed() {
            metadata = metadata.with_accessed(accessed);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions = Some(meta.permissions().mode() & 0o7777);
        }

        metadata
    }

    fn list_recursive<'a>(
        &'a self,
        dir: &'a Path,
        base: &'a Path,
        options: &'a ListOptions,
        depth: usize,
        entries: &'a mut Vec<DirEntry>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if options.is_too_deep(depth) {
                return Ok(());
            }

            let mut read_dir = fs::read_dir(dir).await.map_err(|e| map_io(e, dir))?;
            while let Some(entry) = read_dir.next_entry().await.map_err(|e| map_io(e, dir))? {
                if options.is_full(entries.len()) {
                    return Ok(());
                }

                let name = entry.file_name();
                if options.skips(&name.to_string_lossy()) {
                    continue;
                }

                let entry_path = entry.path();
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| map_io(e, &entry_path))?;
                let relative = entry_path
                    .strip_prefix(base)
                    .unwrap_or(&entry_path)
                    .to_path_buf();

                entries.push(DirEntry::new(
                    relative,
                    entry_path.clone(),
                    Self::convert_metadata(&meta),
                ));

                if meta.is_dir() {
                    self.list_recursive(&entry_path, base, options, depth + 1, entries)
                        .await?;
                }
            }
            Ok(())
        })
    }
}

impl Default for LocalFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn map_io(err: std::io::Error, path: &Path) -> XenonError {
    match err.kind() {
        ErrorKind::NotFound => not_found(NAME, path),
        ErrorKind::AlreadyExists => already_exists(NAME, path),
        _ => XenonError::io(NAME, err),
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    fn adaptor_name(&self) -> &str {
        NAME
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Err(XenonError::closed(NAME, "file system"));
        }
        debug!(location = %self.location, "local file system closed");
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<Metadata> {
        self.ensure_open()?;
        let resolved = self.resolve_path(path);
        let meta = fs::metadata(&resolved).await.map_err(|e| map_io(e, path))?;
        Ok(Self::convert_metadata(&meta))
    }

    async fn list(&self, path: &Path, options: ListOptions) -> Result<Vec<DirEntry>> {
        self.ensure_open()?;
        let resolved = self.resolve_path(path);

        let meta = fs::metadata(&resolved).await.map_err(|e| map_io(e, path))?;
        if !meta.is_dir() {
            return Err(XenonError::invalid_argument(
                NAME,
                format!("{} is not a directory", path.display()),
            ));
        }

        let mut entries = Vec::new();
        self.list_recursive(&resolved, &resolved, &options, 0, &mut entries)
            .await?;
        Ok(entries)
    }

    async fn read(&self, path: &Path) -> Result<ReadStream> {
        self.ensure_open()?;
        let resolved = self.resolve_path(path);
        let file = fs::File::open(&resolved)
            .await
            .map_err(|e| map_io(e, path))?;

        let stream = stream::unfold(
            (file, vec![0u8; self.chunk_size]),
            |(mut file, mut buffer)| async move {
                match file.read(&mut buffer).await {
                    Ok(0) => None,
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buffer[..n]);
                        Some((Ok(data), (file, buffer)))
                    }
                    Err(e) => Some((Err(e), (file, buffer))),
                }
            },
        );

        Ok(Box::pin(stream))
    }

    async fn write(
        &self,
        path: &Path,
        mut reader: Box<dyn AsyncRead + Unpin + Send>,
        options: WriteOptions,
    ) -> Result<u64> {
        self.ensure_open()?;
        let resolved = self.resolve_path(path);

        if options.create_parents {
            if let Some(parent) = resolved.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| XenonError::io(NAME, e))?;
            }
        }

        if !options.overwrite && fs::try_exists(&resolved).await.unwrap_or(false) {
            return Err(already_exists(NAME, path));
        }

        let mut file = fs::File::create(&resolved)
            .await
            .map_err(|e| map_io(e, path))?;
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| XenonError::io(NAME, e))?;
        file.flush().await.map_err(|e| XenonError::io(NAME, e))?;

        #[cfg(unix)]
        if let Some(mode) = options.permissions {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&resolved, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| XenonError::io(NAME, e))?;
        }

        debug!(path = %resolved.display(), bytes = written, "file written");
        Ok(written)
    }

    async fn delete(&self, path: &Path, recursive: bool) -> Result<()> {
        self.ensure_open()?;
        let resolved = self.resolve_path(path);
        let meta = fs::symlink_metadata(&resolved)
            .await
            .map_err(|e| map_io(e, path))?;

        let outcome = if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(&resolved).await
            } else {
                fs::remove_dir(&resolved).await
            }
        } else {
            fs::remove_file(&resolved).await
        };

        outcome.map_err(|e| {
            if meta.is_dir() && !recursive && e.kind() != ErrorKind::NotFound {
                XenonError::invalid_argument(
                    NAME,
                    format!("directory {} is not empty", path.display()),
                )
            } else {
                map_io(e, path)
            }
        })
    }

    async fn mkdir(&self, path: &Path, recursive: bool) -> Result<()> {
        self.ensure_open()?;
        let resolved = self.resolve_path(path);

        if fs::try_exists(&resolved).await.unwrap_or(false) {
            return Err(already_exists(NAME, path));
        }

        let outcome = if recursive {
            fs::create_dir_all(&resolved).await
        } else {
            fs::create_dir(&resolved).await
        };
        outcome.map_err(|e| match e.kind() {
            ErrorKind::NotFound => not_found(NAME, path.parent().unwrap_or(path)),
            _ => map_io(e, path),
        })
    }

    async fn rename(&self, src: &Path, dest: &Path) -> Result<()> {
        self.ensure_open()?;
        let resolved_src = self.resolve_path(src);
        let resolved_dest = self.resolve_path(dest);

        if !fs::try_exists(&resolved_src).await.unwrap_or(false) {
            return Err(not_found(NAME, src));
        }
        if fs::try_exists(&resolved_dest).await.unwrap_or(false) {
            return Err(already_exists(NAME, dest));
        }

        fs::rename(&resolved_src, &resolved_dest)
            .await
            .map_err(|e| map_io(e, src))
    }
}

/// Registry entry for the local file system
#[derive(Debug, Default)]
pub struct LocalFileAdaptor;

#[async_trait]
impl FileAdaptor for LocalFileAdaptor {
    fn descriptor(&self) -> &'static AdaptorDescriptor {
        &DESCRIPTOR
    }

    async fn create_file_system(
        &self,
        location: &str,
        _credential: &Credential,
        properties: Properties,
    ) -> Result<Box<dyn FileSystem>> {
        let chunk_size = usize::try_from(properties.get_size(READ_CHUNK)?)
            .map_err(|_| XenonError::invalid_argument(NAME, "read chunk too large"))?;

        let trimmed = location.trim();
        let file_system = if trimmed.is_empty() || trimmed == "/" {
            LocalFileSystem::new()
        } else {
            let root = PathBuf::from(trimmed);
            let invalid = |message: &str| XenonError::InvalidLocation {
                adaptor: NAME.to_string(),
                location: location.to_string(),
                message: message.to_string(),
            };
            if !root.is_absolute() {
                return Err(invalid("root must be an absolute path"));
            }
            let meta = fs::metadata(&root)
                .await
                .map_err(|_| invalid("root does not exist"))?;
            if !meta.is_dir() {
                return Err(invalid("root is not a directory"));
            }
            LocalFileSystem::with_root(root)
        };

        info!(location = %file_system.location, "local file system opened");
        Ok(Box::new(file_system.with_chunk_size(chunk_size)))
    }
}
