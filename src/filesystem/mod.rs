//! File system adaptors
//!
//! A [`FileSystem`] is an open session on some storage: the local disk or a
//! remote host over SFTP. All paths are interpreted by the adaptor; the
//! local adaptor may be rooted at a directory, in which case absolute paths
//! are resolved below that root.
//!
//! ```no_run
//! use std::path::Path;
//!
//! # async fn demo() -> xenon::Result<()> {
//! let fs = xenon::create_file_system("file://", &xenon::Credential::Default, Default::default()).await?;
//! let meta = fs.stat(Path::new("/etc/hostname")).await?;
//! println!("{} bytes", meta.size);
//! fs.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod copy;
pub mod local;
#[cfg(feature = "ssh")]
pub mod sftp;
pub mod types;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncRead;

pub use copy::{CopyEngine, CopyMode};
pub use local::{LocalFileAdaptor, LocalFileSystem};
#[cfg(feature = "ssh")]
pub use sftp::{SftpAdaptor, SftpFileSystem};
pub use types::{DirEntry, ListOptions, Metadata, ReadStream, WriteOptions};

use crate::error::{Result, XenonError};
use crate::registry::FileAdaptor;

/// File system adaptors compiled into this build
pub fn builtin_adaptors() -> Vec<Arc<dyn FileAdaptor>> {
    #[cfg_attr(not(feature = "ssh"), allow(unused_mut))]
    let mut adaptors: Vec<Arc<dyn FileAdaptor>> = vec![Arc::new(LocalFileAdaptor)];
    #[cfg(feature = "ssh")]
    adaptors.push(Arc::new(SftpAdaptor));
    adaptors
}

/// Uniform file access over one adaptor session
#[async_trait]
pub trait FileSystem: Send + Sync {
    fn adaptor_name(&self) -> &str;

    fn location(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Close the session; closing twice is an error
    async fn close(&self) -> Result<()>;

    async fn stat(&self, path: &Path) -> Result<Metadata>;

    async fn exists(&self, path: &Path) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(XenonError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Entries below `path`, relative to it
    async fn list(&self, path: &Path, options: ListOptions) -> Result<Vec<DirEntry>>;

    async fn read(&self, path: &Path) -> Result<ReadStream>;

    /// Write everything `reader` yields to `path`, returning the byte count
    async fn write(
        &self,
        path: &Path,
        reader: Box<dyn AsyncRead + Unpin + Send>,
        options: WriteOptions,
    ) -> Result<u64>;

    async fn delete(&self, path: &Path, recursive: bool) -> Result<()>;

    async fn mkdir(&self, path: &Path, recursive: bool) -> Result<()>;

    /// Rename within this file system; the target must not exist
    async fn rename(&self, src: &Path, dest: &Path) -> Result<()>;
}

pub(crate) fn not_found(adaptor: &str, path: &Path) -> XenonError {
    XenonError::NotFound {
        adaptor: adaptor.to_string(),
        path: path.display().to_string(),
    }
}

pub(crate) fn already_exists(adaptor: &str, path: &Path) -> XenonError {
    XenonError::AlreadyExists {
        adaptor: adaptor.to_string(),
        path: path.display().to_string(),
    }
}
