//! Scripting scheduler engine
//!
//! Batch systems such as Slurm and Grid Engine are driven by running their
//! command line tools over a [`Transport`]. [`SchedulerConnection`] owns the
//! session; [`ScriptingScheduler`] implements the job lifecycle on top of it
//! and delegates everything that depends on the scheduler's vocabulary to a
//! [`BatchSystem`].
//!
//! Status lookups go to the live queue first. A job that has left the queue
//! is looked up in accounting; if it cannot be found there either it is
//! reported as done with an unknown exit code, provided it was submitted
//! through this session or the batch system keeps no accounting.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use xenon_core_interface::{CommandLine, InteractiveProcess, Transport};

use super::cache::StatusCache;
use super::description::JobDescription;
use super::{
    InteractiveJob, Scheduler, SchedulerCapabilities, CONNECTION_TIMEOUT, POLL_DELAY,
    POLL_MIN_INTERVAL, POLL_RETRIES, STREAM_DRAIN_TIMEOUT,
};
use crate::credential::Credential;
use crate::error::{Result, XenonError};
use crate::location::TransportLocation;
use crate::properties::Properties;
use crate::retry::{with_retry, RetryPolicy};
use crate::runner::RemoteCommandRunner;
use crate::status::{JobFailure, JobStatus};
use crate::transport;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// One open session with a scheduler's host
pub struct SchedulerConnection {
    adaptor: String,
    id: String,
    location: String,
    transport: Arc<dyn Transport>,
    properties: Properties,
    polling_delay: Duration,
    min_interval: Duration,
    drain_timeout: Duration,
    retry: RetryPolicy,
    open: AtomicBool,
}

impl SchedulerConnection {
    /// Connect to `location` with the transport it names
    pub async fn open(
        adaptor: &str,
        location: &str,
        credential: &Credential,
        properties: Properties,
    ) -> Result<Self> {
        let parsed = TransportLocation::parse(adaptor, location)?;
        let timeout = properties.get_duration(CONNECTION_TIMEOUT)?;
        let transport = transport::connect(adaptor, &parsed, credential, timeout).await?;
        Self::with_transport(adaptor, location, transport, properties)
    }

    /// Wrap an already connected transport
    pub fn with_transport(
        adaptor: &str,
        location: &str,
        transport: Arc<dyn Transport>,
        properties: Properties,
    ) -> Result<Self> {
        let polling_delay = properties.get_duration(POLL_DELAY)?;
        let min_interval = properties.get_duration(POLL_MIN_INTERVAL)?;
        let drain_timeout = properties.get_duration(STREAM_DRAIN_TIMEOUT)?;
        let retries = properties.get_natural(POLL_RETRIES)?;

        let id = format!(
            "{}-{}",
            adaptor,
            NEXT_SESSION.fetch_add(1, Ordering::Relaxed)
        );
        info!(adaptor, id = %id, endpoint = %transport.endpoint(), "scheduler session opened");

        Ok(Self {
            adaptor: adaptor.to_string(),
            id,
            location: location.to_string(),
            transport,
            properties,
            polling_delay,
            min_interval,
            drain_timeout,
            retry: RetryPolicy::default().with_max_retries(retries),
            open: AtomicBool::new(true),
        })
    }

    pub fn adaptor(&self) -> &str {
        &self.adaptor
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn polling_delay(&self) -> Duration {
        self.polling_delay
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(XenonError::closed(&self.adaptor, "scheduler"))
        }
    }

    /// Run a command to completion, capturing its output
    pub async fn run(&self, stdin: Option<&str>, command: &CommandLine) -> Result<RemoteCommandRunner> {
        self.ensure_open()?;
        RemoteCommandRunner::run_command(
            self.transport.as_ref(),
            &self.adaptor,
            stdin,
            command,
            self.drain_timeout,
        )
        .await
    }

    /// Run a command that must exit with status zero, stderr ignored
    pub async fn run_checked(
        &self,
        stdin: Option<&str>,
        command: &CommandLine,
    ) -> Result<RemoteCommandRunner> {
        let result = self.run(stdin, command).await?;
        if result.success_ignoring_stderr() {
            Ok(result)
        } else {
            Err(result.failure())
        }
    }

    /// Start a command and hand back the live process
    pub async fn launch(&self, command: &CommandLine) -> Result<Box<dyn InteractiveProcess>> {
        self.ensure_open()?;
        debug!(adaptor = %self.adaptor, command = %command, "launching process");
        self.transport
            .execute(command)
            .await
            .map_err(|e| XenonError::transport(&self.adaptor, e))
    }

    /// Close the session; closing twice is an error
    pub async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Err(XenonError::closed(&self.adaptor, "scheduler"));
        }
        info!(adaptor = %self.adaptor, id = %self.id, "scheduler session closed");
        self.transport
            .close()
            .await
            .map_err(|e| XenonError::transport(&self.adaptor, e))
    }
}

impl std::fmt::Debug for SchedulerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerConnection")
            .field("adaptor", &self.adaptor)
            .field("id", &self.id)
            .field("location", &self.location)
            .field("endpoint", &self.transport.endpoint())
            .field("open", &self.is_open())
            .finish()
    }
}

/// A job as the batch system describes it, before normalization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawStatus {
    /// Native state string
    pub state: String,
    pub exit_code: Option<i32>,
    pub name: Option<String>,
    /// Native explanation for the state, if any
    pub reason: Option<String>,
    pub info: BTreeMap<String, String>,
}

/// Where a native state sits in the job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateClass {
    Pending,
    Running,
    /// Finished; the exit code (if any) is data
    Done,
    /// Finished abnormally according to the scheduler
    Failed,
    Cancelled,
    /// Not recognized
    Unknown,
}

/// The scheduler-specific half of a scripting adaptor
#[async_trait]
pub trait BatchSystem: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn supports_interactive(&self) -> bool {
        false
    }

    /// Reject descriptions this batch system cannot run
    fn validate(&self, description: &JobDescription) -> Result<()>;

    /// Submit a validated description; returns the native job id
    async fn submit(
        &self,
        connection: &SchedulerConnection,
        description: &JobDescription,
    ) -> Result<String>;

    /// Look the job up in the live queue; `None` if it is not listed
    async fn query_queue(
        &self,
        connection: &SchedulerConnection,
        job_id: &str,
    ) -> Result<Option<RawStatus>>;

    /// Whether finished jobs can be looked up after leaving the queue
    fn has_accounting(&self) -> bool {
        false
    }

    /// Look a finished job up in accounting; `None` if it is not recorded
    async fn query_accounting(
        &self,
        _connection: &SchedulerConnection,
        _job_id: &str,
    ) -> Result<Option<RawStatus>> {
        Ok(None)
    }

    async fn cancel(&self, connection: &SchedulerConnection, job_id: &str) -> Result<()>;

    /// Queue names and the default queue, if the batch system has one
    async fn queues(&self, connection: &SchedulerConnection)
        -> Result<(Vec<String>, Option<String>)>;

    /// Ids of the jobs in `queues`, or in all queues when empty
    async fn jobs(&self, connection: &SchedulerConnection, queues: &[String])
        -> Result<Vec<String>>;

    fn classify(&self, raw: &RawStatus) -> StateClass;

    /// Command that runs the description with its streams attached
    fn interactive_command(&self, _description: &JobDescription) -> Result<CommandLine> {
        Err(XenonError::Unsupported {
            adaptor: self.name().to_string(),
            operation: "interactive jobs".to_string(),
        })
    }
}

/// Scheduler driven through a batch system's command line tools
pub struct ScriptingScheduler<B: BatchSystem> {
    system: B,
    connection: SchedulerConnection,
    cache: StatusCache,
    submitted: Mutex<HashSet<String>>,
    cancelled: Mutex<HashSet<String>>,
    interactive: tokio::sync::Mutex<HashMap<String, Box<dyn InteractiveProcess>>>,
    next_interactive: AtomicU64,
}

impl<B: BatchSystem> ScriptingScheduler<B> {
    pub fn new(system: B, connection: SchedulerConnection) -> Self {
        let cache = StatusCache::new(connection.min_interval());
        Self {
            system,
            connection,
            cache,
            submitted: Mutex::new(HashSet::new()),
            cancelled: Mutex::new(HashSet::new()),
            interactive: tokio::sync::Mutex::new(HashMap::new()),
            next_interactive: AtomicU64::new(1),
        }
    }

    pub fn connection(&self) -> &SchedulerConnection {
        &self.connection
    }

    pub fn batch_system(&self) -> &B {
        &self.system
    }

    fn adaptor(&self) -> &str {
        self.connection.adaptor()
    }

    fn was_submitted(&self, job_id: &str) -> bool {
        contains(&self.submitted, job_id)
    }

    fn was_cancelled(&self, job_id: &str) -> bool {
        contains(&self.cancelled, job_id)
    }

    fn remember(&self, job_id: &str) {
        if let Ok(mut submitted) = self.submitted.lock() {
            submitted.insert(job_id.to_string());
        }
    }

    /// Drop bookkeeping for a job whose final status is cached
    fn settle(&self, job_id: &str) {
        for set in [&self.submitted, &self.cancelled] {
            if let Ok(mut ids) = set.lock() {
                ids.remove(job_id);
            }
        }
    }

    fn validate(&self, description: &JobDescription) -> Result<()> {
        description.validate(self.adaptor())?;
        self.system.validate(description)
    }

    /// Normalize a native status
    fn to_status(&self, job_id: &str, raw: &RawStatus) -> JobStatus {
        let state = raw.state.as_str();
        let status = match self.system.classify(raw) {
            StateClass::Pending => JobStatus::pending(job_id, state),
            StateClass::Running => JobStatus::running(job_id, state),
            StateClass::Done => JobStatus::done(job_id, state, raw.exit_code),
            StateClass::Failed => JobStatus::failed(
                job_id,
                state,
                raw.exit_code,
                JobFailure::SchedulerReported {
                    adaptor: self.adaptor().to_string(),
                    job_id: job_id.to_string(),
                    state: state.to_string(),
                    message: raw.reason.clone().unwrap_or_else(|| state.to_string()),
                },
            ),
            StateClass::Cancelled => JobStatus::failed(
                job_id,
                state,
                raw.exit_code,
                JobFailure::Cancelled {
                    adaptor: self.adaptor().to_string(),
                    job_id: job_id.to_string(),
                },
            ),
            StateClass::Unknown => {
                warn!(adaptor = self.adaptor(), job_id, state, "unrecognized job state");
                JobStatus::pending(job_id, state)
            }
        };
        status
            .with_name(raw.name.clone())
            .with_info(raw.info.clone())
    }

    /// One lookup; a job cancelled through this session that has ended
    /// is reported as cancelled
    async fn lookup(&self, job_id: &str) -> Result<JobStatus> {
        let status = self.lookup_native(job_id).await?;
        if status.is_done() && !status.has_exception() && self.was_cancelled(job_id) {
            return Ok(JobStatus::failed(
                job_id,
                "CANCELLED",
                status.exit_code(),
                JobFailure::Cancelled {
                    adaptor: self.adaptor().to_string(),
                    job_id: job_id.to_string(),
                },
            )
            .with_name(status.name().map(str::to_string))
            .with_info(status.scheduler_info().clone()));
        }
        Ok(status)
    }

    /// One lookup through queue and accounting
    async fn lookup_native(&self, job_id: &str) -> Result<JobStatus> {
        if let Some(raw) = self.system.query_queue(&self.connection, job_id).await? {
            return Ok(self.to_status(job_id, &raw));
        }

        if self.system.has_accounting() {
            if let Some(raw) = self
                .system
                .query_accounting(&self.connection, job_id)
                .await?
            {
                return Ok(self.to_status(job_id, &raw));
            }
        }

        if self.was_submitted(job_id)
            || self.was_cancelled(job_id)
            || !self.system.has_accounting()
        {
            debug!(adaptor = self.adaptor(), job_id, "job left the queue, exit code unknown");
            return Ok(JobStatus::done(job_id, "DONE", None));
        }

        Err(XenonError::NoSuchJob {
            adaptor: self.adaptor().to_string(),
            job_id: job_id.to_string(),
        })
    }

    /// Lookup with retries; a transport that stays unreachable is reported
    /// inside the status
    async fn poll(&self, job_id: &str) -> Result<JobStatus> {
        let retry = *self.connection.retry_policy();
        match with_retry(&retry, "job status", || self.lookup(job_id)).await {
            Ok(status) => Ok(status),
            Err(e) if e.is_retriable() => {
                warn!(adaptor = self.adaptor(), job_id, "giving up on status poll: {}", e);
                Ok(JobStatus::unreachable(
                    job_id,
                    JobFailure::Unreachable {
                        adaptor: self.adaptor().to_string(),
                        job_id: job_id.to_string(),
                        message: e.to_string(),
                    },
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Status of an interactive job, from the process itself
    ///
    /// A finished process is dropped once its final status is cached.
    async fn interactive_status(&self, job_id: &str) -> Option<JobStatus> {
        let mut jobs = self.interactive.lock().await;
        let process = jobs.get_mut(job_id)?;
        let status = if process.is_done() {
            let status = JobStatus::done(job_id, "DONE", process.exit_status());
            jobs.remove(job_id);
            status
        } else {
            JobStatus::running(job_id, "RUNNING")
        };
        drop(jobs);
        Some(self.cache.record(status).await)
    }

    async fn destroy_interactive(&self) {
        let mut jobs = self.interactive.lock().await;
        for (job_id, process) in jobs.iter_mut() {
            if !process.is_done() {
                debug!(adaptor = self.adaptor(), job_id = %job_id, "destroying interactive job");
                process.destroy().await;
            }
        }
    }

    fn cancelled_status(&self, job_id: &str) -> JobStatus {
        JobStatus::failed(
            job_id,
            "CANCELLED",
            None,
            JobFailure::Cancelled {
                adaptor: self.adaptor().to_string(),
                job_id: job_id.to_string(),
            },
        )
    }
}

fn contains(ids: &Mutex<HashSet<String>>, job_id: &str) -> bool {
    match ids.lock() {
        Ok(ids) => ids.contains(job_id),
        Err(poisoned) => poisoned.into_inner().contains(job_id),
    }
}

#[async_trait]
impl<B: BatchSystem> Scheduler for ScriptingScheduler<B> {
    fn adaptor_name(&self) -> &str {
        self.adaptor()
    }

    fn location(&self) -> &str {
        self.connection.location()
    }

    fn scheduler_id(&self) -> &str {
        self.connection.id()
    }

    fn capabilities(&self) -> SchedulerCapabilities {
        SchedulerCapabilities {
            supports_batch: true,
            supports_interactive: self.system.supports_interactive(),
            is_embedded: false,
        }
    }

    fn properties(&self) -> &Properties {
        self.connection.properties()
    }

    fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    async fn close(&self) -> Result<()> {
        self.connection.ensure_open()?;
        self.destroy_interactive().await;
        self.connection.close().await
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        self.connection.ensure_open()?;
        let (names, _) = self.system.queues(&self.connection).await?;
        Ok(names)
    }

    async fn default_queue_name(&self) -> Result<Option<String>> {
        self.connection.ensure_open()?;
        let (_, default) = self.system.queues(&self.connection).await?;
        Ok(default)
    }

    async fn get_jobs(&self, queues: &[String]) -> Result<Vec<String>> {
        self.connection.ensure_open()?;
        if !queues.is_empty() {
            let (known, _) = self.system.queues(&self.connection).await?;
            if let Some(unknown) = queues.iter().find(|q| !known.contains(q)) {
                return Err(XenonError::invalid_argument(
                    self.adaptor(),
                    format!("no such queue `{}`", unknown),
                ));
            }
        }
        self.system.jobs(&self.connection, queues).await
    }

    async fn submit_batch_job(&self, description: &JobDescription) -> Result<String> {
        self.connection.ensure_open()?;
        self.validate(description)?;

        let job_id = self.system.submit(&self.connection, description).await?;
        self.remember(&job_id);
        info!(adaptor = self.adaptor(), job_id = %job_id, "submitted batch job");
        Ok(job_id)
    }

    async fn submit_interactive_job(
        &self,
        description: &JobDescription,
    ) -> Result<InteractiveJob> {
        self.connection.ensure_open()?;
        self.validate(description)?;
        if !self.system.supports_interactive() {
            return Err(XenonError::Unsupported {
                adaptor: self.adaptor().to_string(),
                operation: "interactive jobs".to_string(),
            });
        }

        let command = self.system.interactive_command(description)?;
        let mut process = self.connection.launch(&command).await?;
        let streams = process.take_streams();

        let job_id = format!(
            "{}-interactive-{}",
            self.connection.id(),
            self.next_interactive.fetch_add(1, Ordering::Relaxed)
        );
        self.interactive
            .lock()
            .await
            .insert(job_id.clone(), process);
        info!(adaptor = self.adaptor(), job_id = %job_id, "started interactive job");

        Ok(InteractiveJob { job_id, streams })
    }

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatus> {
        self.connection.ensure_open()?;
        if let Some(status) = self.interactive_status(job_id).await {
            return Ok(status);
        }
        let status = self.cache.get_or_poll(job_id, || self.poll(job_id)).await?;
        if status.is_done() {
            self.settle(job_id);
        }
        Ok(status)
    }

    async fn cancel_job(&self, job_id: &str) -> Result<JobStatus> {
        self.connection.ensure_open()?;

        {
            let mut jobs = self.interactive.lock().await;
            if let Some(mut process) = jobs.remove(job_id) {
                drop(jobs);
                if process.is_done() {
                    let status = JobStatus::done(job_id, "DONE", process.exit_status());
                    return Ok(self.cache.record(status).await);
                }
                process.destroy().await;
                info!(adaptor = self.adaptor(), job_id, "cancelled interactive job");
                return Ok(self.cache.record(self.cancelled_status(job_id)).await);
            }
        }

        let current = self.get_job_status(job_id).await?;
        if current.is_done() {
            debug!(adaptor = self.adaptor(), job_id, "cancel of finished job ignored");
            return Ok(current);
        }

        self.system.cancel(&self.connection, job_id).await?;
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.insert(job_id.to_string());
        }
        info!(adaptor = self.adaptor(), job_id, "cancel requested");

        // The batch system acts on the request in its own time
        let status = self.poll(job_id).await?;
        if status.is_unreachable() {
            return Ok(status);
        }
        let status = self.cache.record(status).await;
        if status.is_done() {
            self.settle(job_id);
        }
        Ok(status)
    }

    fn polling_delay(&self) -> Duration {
        self.connection.polling_delay()
    }
}
