//! Job and copy status snapshots
//!
//! A status is an immutable point-in-time view. Failures of the job or copy
//! itself travel inside the snapshot and only become errors when the caller
//! asks for them with `maybe_raise`, so a loop polling many jobs is not
//! interrupted by one of them failing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::error::{Result, XenonError};

/// Why a job ended abnormally
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    #[error("{adaptor} adaptor: job {job_id} was cancelled")]
    Cancelled { adaptor: String, job_id: String },

    #[error("{adaptor} adaptor: job {job_id} failed with state {state}: {message}")]
    SchedulerReported {
        adaptor: String,
        job_id: String,
        state: String,
        message: String,
    },

    /// Status could not be obtained, even after retrying
    #[error("{adaptor} adaptor: status of job {job_id} unavailable: {message}")]
    Unreachable {
        adaptor: String,
        job_id: String,
        message: String,
    },

    #[error("{adaptor} adaptor: job {job_id} could not be started: {message}")]
    LaunchFailed {
        adaptor: String,
        job_id: String,
        message: String,
    },
}

impl JobFailure {
    pub fn adaptor(&self) -> &str {
        match self {
            JobFailure::Cancelled { adaptor, .. }
            | JobFailure::SchedulerReported { adaptor, .. }
            | JobFailure::Unreachable { adaptor, .. }
            | JobFailure::LaunchFailed { adaptor, .. } => adaptor,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, JobFailure::Cancelled { .. })
    }
}

/// Position of a status in the job lifecycle, used to keep snapshots of one
/// job from going backwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPhase {
    Pending,
    Running,
    Done,
}

/// Snapshot of one job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    job_id: String,
    name: Option<String>,
    state: String,
    exit_code: Option<i32>,
    #[serde(rename = "exception")]
    failure: Option<JobFailure>,
    running: bool,
    done: bool,
    scheduler_info: BTreeMap<String, String>,
    observed_at: DateTime<Utc>,
}

impl JobStatus {
    fn new(job_id: &str, state: &str, running: bool, done: bool) -> Self {
        Self {
            job_id: job_id.to_string(),
            name: None,
            state: state.to_string(),
            exit_code: None,
            failure: None,
            running,
            done,
            scheduler_info: BTreeMap::new(),
            observed_at: Utc::now(),
        }
    }

    /// Submitted or queued, not yet running
    pub fn pending(job_id: &str, state: &str) -> Self {
        Self::new(job_id, state, false, false)
    }

    pub fn running(job_id: &str, state: &str) -> Self {
        Self::new(job_id, state, true, false)
    }

    /// Finished normally; a non-zero exit code is not a failure
    pub fn done(job_id: &str, state: &str, exit_code: Option<i32>) -> Self {
        let mut status = Self::new(job_id, state, false, true);
        status.exit_code = exit_code;
        status
    }

    /// Finished with a carried failure
    pub fn failed(job_id: &str, state: &str, exit_code: Option<i32>, failure: JobFailure) -> Self {
        let mut status = Self::done(job_id, state, exit_code);
        status.failure = Some(failure);
        status
    }

    /// Not terminal, but the last poll failed
    pub fn unreachable(job_id: &str, failure: JobFailure) -> Self {
        let mut status = Self::new(job_id, "UNKNOWN", false, false);
        status.failure = Some(failure);
        status
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn with_info(mut self, info: BTreeMap<String, String>) -> Self {
        self.scheduler_info = info;
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Scheduler-native state, for display only
    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        self.failure.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn has_exception(&self) -> bool {
        self.failure.is_some()
    }

    pub fn scheduler_info(&self) -> &BTreeMap<String, String> {
        &self.scheduler_info
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn phase(&self) -> JobPhase {
        if self.done {
            JobPhase::Done
        } else if self.running {
            JobPhase::Running
        } else {
            JobPhase::Pending
        }
    }

    /// Same position in the lifecycle, with a failed poll attached
    pub(crate) fn carrying(&self, failure: JobFailure) -> Self {
        let mut status = self.clone();
        status.failure = Some(failure);
        status.observed_at = Utc::now();
        status
    }

    /// Whether this snapshot only describes a failed poll
    pub fn is_unreachable(&self) -> bool {
        !self.done && matches!(self.failure, Some(JobFailure::Unreachable { .. }))
    }

    /// Return the carried failure as an error, if any
    ///
    /// Can be called any number of times; each call reports the same failure.
    pub fn maybe_raise(&self) -> Result<()> {
        match &self.failure {
            Some(failure) => Err(XenonError::Job(failure.clone())),
            None => Ok(()),
        }
    }
}

/// Why a copy ended abnormally
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CopyFailure {
    #[error("{adaptor} adaptor: copy {copy_id} was cancelled")]
    Cancelled { adaptor: String, copy_id: String },

    #[error("{adaptor} adaptor: copy {copy_id} failed: {message}")]
    Failed {
        adaptor: String,
        copy_id: String,
        message: String,
    },
}

impl CopyFailure {
    pub fn adaptor(&self) -> &str {
        match self {
            CopyFailure::Cancelled { adaptor, .. } | CopyFailure::Failed { adaptor, .. } => adaptor,
        }
    }
}

/// Lifecycle state of an asynchronous copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CopyState {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl std::fmt::Display for CopyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CopyState::Pending => "PENDING",
            CopyState::Running => "RUNNING",
            CopyState::Done => "DONE",
            CopyState::Failed => "FAILED",
            CopyState::Cancelled => "CANCELLED",
        };
        write!(f, "{}", name)
    }
}

/// Snapshot of one asynchronous copy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CopyStatus {
    copy_id: String,
    state: CopyState,
    bytes_to_copy: Option<u64>,
    bytes_copied: u64,
    #[serde(rename = "exception")]
    failure: Option<CopyFailure>,
}

impl CopyStatus {
    pub fn new(
        copy_id: &str,
        state: CopyState,
        bytes_to_copy: Option<u64>,
        bytes_copied: u64,
        failure: Option<CopyFailure>,
    ) -> Self {
        Self {
            copy_id: copy_id.to_string(),
            state,
            bytes_to_copy,
            bytes_copied,
            failure,
        }
    }

    pub fn copy_id(&self) -> &str {
        &self.copy_id
    }

    pub fn state(&self) -> CopyState {
        self.state
    }

    pub fn bytes_to_copy(&self) -> Option<u64> {
        self.bytes_to_copy
    }

    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied
    }

    pub fn failure(&self) -> Option<&CopyFailure> {
        self.failure.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.state == CopyState::Running
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self.state,
            CopyState::Done | CopyState::Failed | CopyState::Cancelled
        )
    }

    pub fn has_exception(&self) -> bool {
        self.failure.is_some()
    }

    /// Return the carried failure as an error, if any
    pub fn maybe_raise(&self) -> Result<()> {
        match &self.failure {
            Some(failure) => Err(XenonError::Copy(failure.clone())),
            None => Ok(()),
        }
    }
}
