//! Asynchronous single-file copies between file systems
//!
//! A copy runs on a background task. Bytes are pumped from the source's read
//! stream into a pipe the target's `write` drains, so the two sides may live
//! on different adaptors. Callers follow progress through [`CopyStatus`]
//! snapshots and learn about failures through the snapshot, never through a
//! panic or a dropped task.

use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{already_exists, FileSystem, WriteOptions};
use crate::deadline::Deadline;
use crate::error::{Result, XenonError};
use crate::status::{CopyFailure, CopyState, CopyStatus};

const PIPE_CAPACITY: usize = 256 * 1024;

/// What to do when the target already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyMode {
    /// Fail with `AlreadyExists`
    #[default]
    Create,
    /// Overwrite the target
    Replace,
    /// Leave the target alone and report the copy as done
    Ignore,
}

impl FromStr for CopyMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(CopyMode::Create),
            "replace" => Ok(CopyMode::Replace),
            "ignore" => Ok(CopyMode::Ignore),
            other => Err(format!(
                "unknown copy mode `{}` (expected create, replace or ignore)",
                other
            )),
        }
    }
}

impl fmt::Display for CopyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CopyMode::Create => "create",
            CopyMode::Replace => "replace",
            CopyMode::Ignore => "ignore",
        };
        write!(f, "{}", name)
    }
}

struct CopyTask {
    id: String,
    adaptor: String,
    bytes_to_copy: Option<u64>,
    copied: AtomicU64,
    cancelled: AtomicBool,
    outcome: Mutex<Option<(CopyState, Option<CopyFailure>)>>,
    done: watch::Sender<bool>,
}

impl CopyTask {
    fn new(id: String, adaptor: &str, bytes_to_copy: Option<u64>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id,
            adaptor: adaptor.to_string(),
            bytes_to_copy,
            copied: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            outcome: Mutex::new(None),
            done,
        }
    }

    fn status(&self) -> CopyStatus {
        let outcome = self
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let (state, failure) = outcome.unwrap_or((CopyState::Running, None));
        CopyStatus::new(
            &self.id,
            state,
            self.bytes_to_copy,
            self.copied.load(Ordering::Acquire),
            failure,
        )
    }

    fn finish(&self, state: CopyState, failure: Option<CopyFailure>) {
        *self
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((state, failure));
        self.done.send_replace(true);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Runs and tracks asynchronous copies
#[derive(Default)]
pub struct CopyEngine {
    copies: Mutex<HashMap<String, Arc<CopyTask>>>,
    next_id: AtomicU64,
}

impl CopyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start copying `source_path` to `target_path`, returning the copy id
    ///
    /// The source is checked and the target's existence is resolved against
    /// `mode` before anything is spawned, so those errors surface here.
    pub async fn start(
        &self,
        source: Arc<dyn FileSystem>,
        source_path: &Path,
        target: Arc<dyn FileSystem>,
        target_path: &Path,
        mode: CopyMode,
    ) -> Result<String> {
        let meta = source.stat(source_path).await?;
        if !meta.is_file {
            return Err(XenonError::invalid_argument(
                source.adaptor_name(),
                format!("{} is not a regular file", source_path.display()),
            ));
        }

        let id = format!("copy-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = Arc::new(CopyTask::new(id.clone(), target.adaptor_name(), Some(meta.size)));
        self.lock().insert(id.clone(), task.clone());

        if target.exists(target_path).await? {
            match mode {
                CopyMode::Create => {
                    self.lock().remove(&id);
                    return Err(already_exists(target.adaptor_name(), target_path));
                }
                CopyMode::Ignore => {
                    debug!(copy = %id, target = %target_path.display(), "target exists, copy skipped");
                    task.finish(CopyState::Done, None);
                    return Ok(id);
                }
                CopyMode::Replace => {}
            }
        }

        info!(
            copy = %id,
            from = %format!("{}:{}", source.adaptor_name(), source_path.display()),
            to = %format!("{}:{}", target.adaptor_name(), target_path.display()),
            bytes = meta.size,
            "copy started"
        );

        let source_path = source_path.to_path_buf();
        let target_path = target_path.to_path_buf();
        tokio::spawn(run(task, source, source_path, target, target_path));

        Ok(id)
    }

    pub fn get_status(&self, copy_id: &str) -> Result<CopyStatus> {
        Ok(self.task(copy_id)?.status())
    }

    /// Wait until the copy ends or the timeout passes, zero meaning forever
    ///
    /// Reaching the timeout is not an error; inspect `is_done` on the result.
    pub async fn wait_until_done(&self, copy_id: &str, timeout_millis: i64) -> Result<CopyStatus> {
        let deadline = Deadline::after_millis(timeout_millis)?;
        let task = self.task(copy_id)?;
        let mut done = task.done.subscribe();

        match deadline.remaining() {
            None => {
                let _ = done.wait_for(|finished| *finished).await;
            }
            Some(left) => {
                let _ = tokio::time::timeout(left, done.wait_for(|finished| *finished)).await;
            }
        }

        Ok(task.status())
    }

    /// Cancel a running copy and wait for it to stop
    ///
    /// A partially written target is removed. Cancelling a finished copy
    /// returns its final status unchanged.
    pub async fn cancel(&self, copy_id: &str) -> Result<CopyStatus> {
        let task = self.task(copy_id)?;
        if task.status().is_done() {
            return Ok(task.status());
        }
        task.cancelled.store(true, Ordering::Release);
        self.wait_until_done(copy_id, 0).await
    }

    fn task(&self, copy_id: &str) -> Result<Arc<CopyTask>> {
        self.lock()
            .get(copy_id)
            .cloned()
            .ok_or_else(|| XenonError::NoSuchCopy {
                adaptor: "copy".to_string(),
                copy_id: copy_id.to_string(),
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<CopyTask>>> {
        self.copies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run(
    task: Arc<CopyTask>,
    source: Arc<dyn FileSystem>,
    source_path: PathBuf,
    target: Arc<dyn FileSystem>,
    target_path: PathBuf,
) {
    let result = transfer(&task, source.as_ref(), &source_path, target.as_ref(), &target_path).await;

    if task.is_cancelled() {
        if let Err(e) = target.delete(&target_path, false).await {
            debug!(copy = %task.id, error = %e, "could not remove partial target");
        }
        info!(copy = %task.id, "copy cancelled");
        task.finish(
            CopyState::Cancelled,
            Some(CopyFailure::Cancelled {
                adaptor: task.adaptor.clone(),
                copy_id: task.id.clone(),
            }),
        );
        return;
    }

    match result {
        Ok(bytes) => {
            info!(copy = %task.id, bytes, "copy done");
            task.finish(CopyState::Done, None);
        }
        Err(e) => {
            warn!(copy = %task.id, error = %e, "copy failed");
            task.finish(
                CopyState::Failed,
                Some(CopyFailure::Failed {
                    adaptor: e.adaptor().unwrap_or(&task.adaptor).to_string(),
                    copy_id: task.id.clone(),
                    message: e.to_string(),
                }),
            );
        }
    }
}

async fn transfer(
    task: &Arc<CopyTask>,
    source: &dyn FileSystem,
    source_path: &Path,
    target: &dyn FileSystem,
    target_path: &Path,
) -> Result<u64> {
    let mut stream = source.read(source_path).await?;
    let (mut tx, rx) = tokio::io::duplex(PIPE_CAPACITY);

    let progress = task.clone();
    let pump = async move {
        while let Some(chunk) = stream.next().await {
            if progress.is_cancelled() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "copy cancelled",
                ));
            }
            let chunk = chunk?;
            tx.write_all(&chunk).await?;
            progress
                .copied
                .fetch_add(chunk.len() as u64, Ordering::AcqRel);
        }
        tx.shutdown().await
    };

    let options = WriteOptions {
        overwrite: true,
        ..WriteOptions::default()
    };
    let (pumped, written) = tokio::join!(pump, target.write(target_path, Box::new(rx), options));

    let written = written?;
    pumped.map_err(|e| XenonError::io(source.adaptor_name(), e))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::LocalFileSystem;
    use tempfile::TempDir;

    fn local() -> Arc<dyn FileSystem> {
        Arc::new(LocalFileSystem::new())
    }

    #[tokio::test]
    async fn test_copy_to_completion() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("out/dst.bin");
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let engine = CopyEngine::new();
        let id = engine
            .start(local(), &src, local(), &dst, CopyMode::Create)
            .await
            .unwrap();

        let status = engine.wait_until_done(&id, 5_000).await.unwrap();
        assert!(status.is_done());
        assert!(!status.has_exception());
        assert_eq!(status.state(), CopyState::Done);
        assert_eq!(status.bytes_to_copy(), Some(data.len() as u64));
        assert_eq!(status.bytes_copied(), data.len() as u64);
        assert_eq!(std::fs::read(&dst).unwrap(), data);
    }

    #[tokio::test]
    async fn test_create_mode_refuses_existing_target() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dst, b"old").unwrap();

        let engine = CopyEngine::new();
        let err = engine
            .start(local(), &src, local(), &dst, CopyMode::Create)
            .await
            .unwrap_err();
        assert!(matches!(err, XenonError::AlreadyExists { .. }));

        let id = engine
            .start(local(), &src, local(), &dst, CopyMode::Ignore)
            .await
            .unwrap();
        let status = engine.get_status(&id).unwrap();
        assert!(status.is_done());
        assert_eq!(status.bytes_copied(), 0);
        assert_eq!(std::fs::read(&dst).unwrap(), b"old");

        let id = engine
            .start(local(), &src, local(), &dst, CopyMode::Replace)
            .await
            .unwrap();
        engine.wait_until_done(&id, 0).await.unwrap().maybe_raise().unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_missing_source_fails_at_start() {
        let dir = TempDir::new().unwrap();
        let engine = CopyEngine::new();
        let err = engine
            .start(
                local(),
                &dir.path().join("missing"),
                local(),
                &dir.path().join("x"),
                CopyMode::Create,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, XenonError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_write_failure_is_carried() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::write(&src, b"payload").unwrap();
        std::fs::create_dir(dir.path().join("taken")).unwrap();

        let engine = CopyEngine::new();
        // the target is a directory, so creating the file fails
        let id = engine
            .start(
                local(),
                &src,
                local(),
                &dir.path().join("taken"),
                CopyMode::Replace,
            )
            .await
            .unwrap();

        let status = engine.wait_until_done(&id, 5_000).await.unwrap();
        assert_eq!(status.state(), CopyState::Failed);
        assert!(status.maybe_raise().is_err());
        assert!(status.maybe_raise().is_err());
        assert_eq!(status.failure().map(|f| f.adaptor()), Some("file"));
    }

    #[tokio::test]
    async fn test_cancel_finished_copy_is_noop() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, b"abc").unwrap();

        let engine = CopyEngine::new();
        let id = engine
            .start(local(), &src, local(), &dst, CopyMode::Create)
            .await
            .unwrap();
        engine.wait_until_done(&id, 0).await.unwrap();

        let status = engine.cancel(&id).await.unwrap();
        assert_eq!(status.state(), CopyState::Done);
        assert!(dst.exists());
    }

    #[tokio::test]
    async fn test_unknown_copy() {
        let engine = CopyEngine::new();
        assert!(matches!(
            engine.get_status("copy-99").unwrap_err(),
            XenonError::NoSuchCopy { .. }
        ));
        assert!(engine.wait_until_done("copy-99", -1).await.is_err());
    }

    #[test]
    fn test_copy_mode_parse() {
        assert_eq!("Replace".parse::<CopyMode>().unwrap(), CopyMode::Replace);
        assert!("merge".parse::<CopyMode>().is_err());
        assert_eq!(CopyMode::default().to_string(), "create");
    }
}
