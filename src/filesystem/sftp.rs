//! SFTP file system adaptor
//!
//! Runs over the SSH transport's control session. ssh2 is blocking, so every
//! operation hops onto the blocking pool; file contents are buffered whole.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use ssh2::{ErrorCode, FileStat, Sftp};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};
use xenon_core_interface::Transport;

use super::types::{DirEntry, ListOptions, Metadata, ReadStream, WriteOptions};
use super::{already_exists, not_found, FileSystem};
use crate::credential::Credential;
use crate::error::{Result, XenonError};
use crate::location::TransportLocation;
use crate::properties::{Properties, PropertyDescription, PropertyType};
use crate::registry::{AdaptorDescriptor, FileAdaptor};
use crate::scheduler::CONNECTION_TIMEOUT;
use crate::transport::{SshConfig, SshTransport};

pub const NAME: &str = "sftp";

const CHUNK: usize = 64 * 1024;
const LARGE_FILE: u64 = 1_000_000_000;

static PROPERTIES: &[PropertyDescription] = &[PropertyDescription::new(
    CONNECTION_TIMEOUT,
    PropertyType::Duration,
    Some("30s"),
    "Timeout for establishing the SSH session",
)];

pub static DESCRIPTOR: AdaptorDescriptor = AdaptorDescriptor {
    name: NAME,
    description: "Files on a remote host over SFTP",
    schemes: &["sftp"],
    location_patterns: &["[user@]host[:port]"],
    properties: PROPERTIES,
};

/// Remote file system session
pub struct SftpFileSystem {
    location: String,
    transport: SshTransport,
    sftp: Arc<Sftp>,
    open: AtomicBool,
}

impl SftpFileSystem {
    pub async fn connect(location: &str, config: SshConfig) -> Result<Self> {
        let transport = SshTransport::connect(config)
            .await
            .map_err(|e| XenonError::transport(NAME, e))?;
        let sftp = transport
            .sftp()
            .await
            .map_err(|e| XenonError::transport(NAME, e))?;

        info!(location, "sftp file system opened");
        Ok(Self {
            location: location.to_string(),
            transport,
            sftp: Arc::new(sftp),
            open: AtomicBool::new(true),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(XenonError::closed(NAME, "file system"))
        }
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
    {
        self.ensure_open()?;
        let sftp = self.sftp.clone();
        tokio::task::spawn_blocking(move || work(&sftp))
            .await
            .map_err(|e| XenonError::io(NAME, std::io::Error::other(e)))?
    }
}

fn sftp_error(err: ssh2::Error, path: &Path, action: &str) -> XenonError {
    // SSH_FX_NO_SUCH_FILE
    if err.code() == ErrorCode::SFTP(2) {
        return not_found(NAME, path);
    }
    XenonError::io(
        NAME,
        std::io::Error::other(format!("{} {}: {}", action, path.display(), err)),
    )
}

fn convert_stat(stat: &FileStat) -> Metadata {
    let size = stat.size.unwrap_or(0);
    let mut metadata = if stat.is_file() {
        Metadata::file(size)
    } else if stat.is_dir() {
        Metadata::directory()
    } else {
        Metadata::symlink(size)
    };

    if let Some(mtime) = stat.mtime {
        metadata = metadata.with_modified(std::time::UNIX_EPOCH + std::time::Duration::from_secs(mtime));
    }
    if let Some(atime) = stat.atime {
        metadata = metadata.with_accessed(std::time::UNIX_EPOCH + std::time::Duration::from_secs(atime));
    }
    metadata.permissions = stat.perm.map(|p| p & 0o7777);
    metadata
}

fn list_blocking(
    sftp: &Sftp,
    dir: &Path,
    base: &Path,
    options: &ListOptions,
    depth: usize,
    entries: &mut Vec<DirEntry>,
) -> Result<()> {
    if options.is_too_deep(depth) {
        return Ok(());
    }

    let children = sftp
        .readdir(dir)
        .map_err(|e| sftp_error(e, dir, "read directory"))?;

    for (entry_path, stat) in children {
        if options.is_full(entries.len()) {
            return Ok(());
        }
        let name = entry_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name == "." || name == ".." || options.skips(&name) {
            continue;
        }

        let relative = entry_path
            .strip_prefix(base)
            .unwrap_or(&entry_path)
            .to_path_buf();
        entries.push(DirEntry::new(relative, entry_path.clone(), convert_stat(&stat)));

        if stat.is_dir() {
            list_blocking(sftp, &entry_path, base, options, depth + 1, entries)?;
        }
    }
    Ok(())
}

fn remove_dir_all(sftp: &Sftp, path: &Path) -> Result<()> {
    for (entry_path, stat) in sftp
        .readdir(path)
        .map_err(|e| sftp_error(e, path, "read directory"))?
    {
        if stat.is_dir() {
            remove_dir_all(sftp, &entry_path)?;
        } else {
            sftp.unlink(&entry_path)
                .map_err(|e| sftp_error(e, &entry_path, "delete"))?;
        }
    }
    sftp.rmdir(path).map_err(|e| sftp_error(e, path, "remove directory"))
}

#[async_trait]
impl FileSystem for SftpFileSystem {
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
        self.transport
            .close()
            .await
            .map_err(|e| XenonError::transport(NAME, e))
    }

    async fn stat(&self, path: &Path) -> Result<Metadata> {
        let path = path.to_path_buf();
        self.blocking(move |sftp| {
            let stat = sftp.stat(&path).map_err(|e| sftp_error(e, &path, "stat"))?;
            Ok(convert_stat(&stat))
        })
        .await
    }

    async fn list(&self, path: &Path, options: ListOptions) -> Result<Vec<DirEntry>> {
        let path = path.to_path_buf();
        self.blocking(move |sftp| {
            let mut entries = Vec::new();
            list_blocking(sftp, &path, &path, &options, 0, &mut entries)?;
            Ok(entries)
        })
        .await
    }

    async fn read(&self, path: &Path) -> Result<ReadStream> {
        let path = path.to_path_buf();
        let data = self
            .blocking(move |sftp| {
                use std::io::Read;

                let mut file = sftp.open(&path).map_err(|e| sftp_error(e, &path, "open"))?;
                let size = file.stat().ok().and_then(|s| s.size).unwrap_or(0);
                if size > LARGE_FILE {
                    warn!(path = %path.display(), size, "buffering large remote file in memory");
                }
                let mut buffer = Vec::with_capacity(size as usize);
                file.read_to_end(&mut buffer)
                    .map_err(|e| XenonError::io(NAME, e))?;
                Ok(Bytes::from(buffer))
            })
            .await?;

        let chunks: Vec<std::io::Result<Bytes>> = (0..data.len())
            .step_by(CHUNK)
            .map(|start| Ok(data.slice(start..(start + CHUNK).min(data.len()))))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn write(
        &self,
        path: &Path,
        mut reader: Box<dyn AsyncRead + Unpin + Send>,
        options: WriteOptions,
    ) -> Result<u64> {
        self.ensure_open()?;
        let mut buffer = Vec::new();
        reader
            .read_to_end(&mut buffer)
            .await
            .map_err(|e| XenonError::io(NAME, e))?;

        let path = path.to_path_buf();
        self.blocking(move |sftp| {
            use std::io::Write;

            if options.create_parents {
                if let Some(parent) = path.parent() {
                    let mut current = PathBuf::new();
                    for component in parent.components() {
                        current.push(component);
                        if sftp.stat(&current).is_err() {
                            sftp.mkdir(&current, 0o755).ok();
                        }
                    }
                }
            }

            if !options.overwrite && sftp.stat(&path).is_ok() {
                return Err(already_exists(NAME, &path));
            }

            let mut file = sftp
                .create(&path)
                .map_err(|e| sftp_error(e, &path, "create"))?;
            file.write_all(&buffer)
                .map_err(|e| XenonError::io(NAME, e))?;

            if let Some(perm) = options.permissions {
                file.setstat(FileStat {
                    size: None,
                    uid: None,
                    gid: None,
                    perm: Some(perm),
                    atime: None,
                    mtime: None,
                })
                .ok();
            }

            Ok(buffer.len() as u64)
        })
        .await
    }

    async fn delete(&self, path: &Path, recursive: bool) -> Result<()> {
        let path = path.to_path_buf();
        self.blocking(move |sftp| {
            let stat = sftp.lstat(&path).map_err(|e| sftp_error(e, &path, "stat"))?;
            if !stat.is_dir() {
                return sftp.unlink(&path).map_err(|e| sftp_error(e, &path, "delete"));
            }
            if recursive {
                remove_dir_all(sftp, &path)
            } else {
                sftp.rmdir(&path).map_err(|_| {
                    XenonError::invalid_argument(
                        NAME,
                        format!("directory {} is not empty", path.display()),
                    )
                })
            }
        })
        .await
    }

    async fn mkdir(&self, path: &Path, recursive: bool) -> Result<()> {
        let path = path.to_path_buf();
        self.blocking(move |sftp| {
            if sftp.stat(&path).is_ok() {
                return Err(already_exists(NAME, &path));
            }

            if recursive {
                let mut current = PathBuf::new();
                for component in path.components() {
                    current.push(component);
                    if sftp.stat(&current).is_err() {
                        sftp.mkdir(&current, 0o755)
                            .map_err(|e| sftp_error(e, &current, "create directory"))?;
                    }
                }
                Ok(())
            } else {
                sftp.mkdir(&path, 0o755)
                    .map_err(|e| sftp_error(e, &path, "create directory"))
            }
        })
        .await
    }

    async fn rename(&self, src: &Path, dest: &Path) -> Result<()> {
        let src = src.to_path_buf();
        let dest = dest.to_path_buf();
        self.blocking(move |sftp| {
            sftp.stat(&src).map_err(|e| sftp_error(e, &src, "stat"))?;
            if sftp.stat(&dest).is_ok() {
                return Err(already_exists(NAME, &dest));
            }
            sftp.rename(&src, &dest, None)
                .map_err(|e| sftp_error(e, &src, "rename"))
        })
        .await
    }
}

/// Registry entry for SFTP
#[derive(Debug, Default)]
pub struct SftpAdaptor;

#[async_trait]
impl FileAdaptor for SftpAdaptor {
    fn descriptor(&self) -> &'static AdaptorDescriptor {
        &DESCRIPTOR
    }

    async fn create_file_system(
        &self,
        location: &str,
        credential: &Credential,
        properties: Properties,
    ) -> Result<Box<dyn FileSystem>> {
        let ssh = match TransportLocation::parse(NAME, location)? {
            TransportLocation::Ssh(ssh) => ssh,
            TransportLocation::Local => {
                return Err(XenonError::InvalidLocation {
                    adaptor: NAME.to_string(),
                    location: location.to_string(),
                    message: "expected [user@]host[:port]".to_string(),
                })
            }
        };

        let config = SshConfig::new(ssh, credential.clone())
            .with_timeout(properties.get_duration(CONNECTION_TIMEOUT)?);
        Ok(Box::new(SftpFileSystem::connect(location, config).await?))
    }
}
