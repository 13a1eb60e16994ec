//! Schedulers: submitting and tracking jobs
//!
//! A [`Scheduler`] is one open session with a batch system or a shell. It is
//! created by a scheduler adaptor from a location, a credential and a property
//! map (see [`crate::registry`]), and stays usable until [`Scheduler::close`].
//!
//! Job outcomes are data. Cancellation, scheduler-reported failures and
//! unreachable schedulers show up inside the returned [`JobStatus`] and only
//! become errors through [`JobStatus::maybe_raise`]. Errors returned directly
//! by the trait methods are about the request itself: bad input, a closed
//! session, a transport that cannot be reached.
//!
//! # Example
//!
//! ```no_run
//! use xenon::scheduler::JobDescription;
//! use xenon::Credential;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scheduler =
//!         xenon::create_scheduler("local://", &Credential::Default, Default::default()).await?;
//!
//!     let job = scheduler
//!         .submit_batch_job(&JobDescription::command("sleep", ["1"]))
//!         .await?;
//!     let status = scheduler.wait_until_done(&job, 10_000).await?;
//!     status.maybe_raise()?;
//!     println!("exit code: {:?}", status.exit_code());
//!
//!     scheduler.close().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod description;
pub mod gridengine;
pub mod process;
pub mod script;
pub mod scripting;
pub mod slurm;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use xenon_core_interface::ProcessStreams;

use crate::deadline::Deadline;
use crate::error::Result;
use crate::properties::Properties;
use crate::registry::SchedulerAdaptor;
use crate::status::{JobFailure, JobStatus};

pub use description::{JobDescription, JobTask};
pub use gridengine::GridEngineAdaptor;
pub use process::{LocalSchedulerAdaptor, ProcessScheduler};
#[cfg(feature = "ssh")]
pub use process::SshSchedulerAdaptor;
pub use scripting::{SchedulerConnection, ScriptingScheduler};
pub use slurm::SlurmAdaptor;

/// Scheduler adaptors compiled into this build
pub fn builtin_adaptors() -> Vec<Arc<dyn SchedulerAdaptor>> {
    #[cfg_attr(not(feature = "ssh"), allow(unused_mut))]
    let mut adaptors: Vec<Arc<dyn SchedulerAdaptor>> = vec![
        Arc::new(LocalSchedulerAdaptor),
        Arc::new(SlurmAdaptor),
        Arc::new(GridEngineAdaptor),
    ];
    #[cfg(feature = "ssh")]
    adaptors.push(Arc::new(SshSchedulerAdaptor));
    adaptors
}

/// Name of the property holding the delay between two polls of a wait loop
pub const POLL_DELAY: &str = "poll.delay";
/// Minimum age of a cached status before the scheduler is queried again
pub const POLL_MIN_INTERVAL: &str = "poll.min_interval";
/// How often a failed status query is retried
pub const POLL_RETRIES: &str = "poll.retries";
/// How long output pumps may drain after a helper command exits
pub const STREAM_DRAIN_TIMEOUT: &str = "stream.drain_timeout";
/// Timeout for establishing the transport session
pub const CONNECTION_TIMEOUT: &str = "connection.timeout";

/// Property table with the engine tuning knobs every scheduler adaptor accepts,
/// followed by adaptor-specific entries
macro_rules! scheduler_properties {
    ($($extra:expr),* $(,)?) => {
        &[
            $crate::properties::PropertyDescription::new(
                $crate::scheduler::POLL_DELAY,
                $crate::properties::PropertyType::Duration,
                Some("1s"),
                "Delay between two status polls while waiting for a job",
            ),
            $crate::properties::PropertyDescription::new(
                $crate::scheduler::POLL_MIN_INTERVAL,
                $crate::properties::PropertyType::Duration,
                Some("100ms"),
                "Minimum interval between two scheduler queries for the same job",
            ),
            $crate::properties::PropertyDescription::new(
                $crate::scheduler::POLL_RETRIES,
                $crate::properties::PropertyType::Natural,
                Some("3"),
                "Retries of a status query that failed with a transient error",
            ),
            $crate::properties::PropertyDescription::new(
                $crate::scheduler::STREAM_DRAIN_TIMEOUT,
                $crate::properties::PropertyType::Duration,
                Some("1s"),
                "Time allowed for command output to drain after the command exits",
            ),
            $crate::properties::PropertyDescription::new(
                $crate::scheduler::CONNECTION_TIMEOUT,
                $crate::properties::PropertyType::Duration,
                Some("30s"),
                "Timeout for connecting to a remote location",
            ),
            $($extra,)*
        ]
    };
}
pub(crate) use scheduler_properties;

/// What a scheduler session can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerCapabilities {
    pub supports_batch: bool,
    pub supports_interactive: bool,
    /// Jobs run inside this process's session and die with it
    pub is_embedded: bool,
}

/// A running interactive job
///
/// The process is the job: its streams are handed to the caller, and
/// [`Scheduler::get_job_status`] reports on the process itself.
#[derive(Debug)]
pub struct InteractiveJob {
    pub job_id: String,
    pub streams: ProcessStreams,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Name of the adaptor that created this session
    fn adaptor_name(&self) -> &str;

    /// Location string the session was created for
    fn location(&self) -> &str;

    /// Unique id of this session within the process
    fn scheduler_id(&self) -> &str;

    fn capabilities(&self) -> SchedulerCapabilities;

    /// Validated properties this session was created with
    fn properties(&self) -> &Properties;

    fn is_open(&self) -> bool;

    /// Close the session
    ///
    /// # Errors
    ///
    /// [`XenonError::Closed`](crate::XenonError::Closed) if it was already
    /// closed.
    async fn close(&self) -> Result<()>;

    async fn queue_names(&self) -> Result<Vec<String>>;

    async fn default_queue_name(&self) -> Result<Option<String>>;

    /// Ids of the jobs in `queues`, or in all queues when empty
    async fn get_jobs(&self, queues: &[String]) -> Result<Vec<String>>;

    /// Submit a job with its output redirected to files; returns the job id
    async fn submit_batch_job(&self, description: &JobDescription) -> Result<String>;

    /// Start a job whose streams stay attached to the caller
    async fn submit_interactive_job(&self, description: &JobDescription)
        -> Result<InteractiveJob>;

    /// Fresh snapshot of one job
    async fn get_job_status(&self, job_id: &str) -> Result<JobStatus>;

    /// Ask the scheduler to cancel a job
    ///
    /// Returns without waiting for the cancellation to take effect. Cancelling
    /// a job that is already done is a no-op.
    async fn cancel_job(&self, job_id: &str) -> Result<JobStatus>;

    /// Sleep between two polls of a wait loop
    fn polling_delay(&self) -> Duration;

    /// Snapshots of several jobs; a job whose status cannot be obtained gets
    /// a snapshot carrying the failure instead of failing the whole call
    async fn get_job_statuses(&self, job_ids: &[String]) -> Vec<JobStatus> {
        let mut statuses = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            let status = match self.get_job_status(job_id).await {
                Ok(status) => status,
                Err(e) => {
                    debug!(adaptor = self.adaptor_name(), job_id = %job_id, "status unavailable: {}", e);
                    JobStatus::unreachable(
                        job_id,
                        JobFailure::Unreachable {
                            adaptor: self.adaptor_name().to_string(),
                            job_id: job_id.clone(),
                            message: e.to_string(),
                        },
                    )
                }
            };
            statuses.push(status);
        }
        statuses
    }

    /// Poll until the job is done or `timeout_millis` passed (zero waits
    /// forever) and return the last snapshot
    ///
    /// Reaching the deadline is not an error; check
    /// [`JobStatus::is_done`] on the result.
    async fn wait_until_done(&self, job_id: &str, timeout_millis: i64) -> Result<JobStatus> {
        let deadline = Deadline::after_millis(timeout_millis)?;
        loop {
            let status = self.get_job_status(job_id).await?;
            if status.is_done() || deadline.has_passed() {
                return Ok(status);
            }
            trace!(job_id, state = status.state(), "job not done yet");
            tokio::time::sleep(deadline.clamp(self.polling_delay())).await;
        }
    }

    /// Like [`wait_until_done`](Self::wait_until_done), but also stops once
    /// the job is running
    async fn wait_until_running(&self, job_id: &str, timeout_millis: i64) -> Result<JobStatus> {
        let deadline = Deadline::after_millis(timeout_millis)?;
        loop {
            let status = self.get_job_status(job_id).await?;
            if status.is_running() || status.is_done() || deadline.has_passed() {
                return Ok(status);
            }
            tokio::time::sleep(deadline.clamp(self.polling_delay())).await;
        }
    }
}
