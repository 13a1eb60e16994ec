//! Blocking scheduler API
//!
//! Wraps an async [`crate::scheduler::Scheduler`] together with the Tokio
//! runtime it lives on, for callers that are not async themselves. The
//! runtime is multi-threaded so stream forwarders and watchdogs keep running
//! between calls.
//!
//! Must not be created or dropped from inside an async context.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

use crate::credential::Credential;
use crate::error::{Result, XenonError};
use crate::registry::{self, AdaptorRegistry};
use crate::scheduler::{JobDescription, Scheduler as AsyncScheduler, SchedulerCapabilities};
use crate::status::JobStatus;

/// A scheduler session driven by its own runtime
pub struct Scheduler {
    inner: Box<dyn AsyncScheduler>,
    runtime: Runtime,
}

impl Scheduler {
    /// Open a scheduler for `scheme://location` through the global registry
    pub fn create(
        uri: &str,
        credential: &Credential,
        properties: BTreeMap<String, String>,
    ) -> Result<Self> {
        Self::create_with(registry::global()?, uri, credential, properties)
    }

    /// Open a scheduler through an explicit registry
    pub fn create_with(
        registry: &AdaptorRegistry,
        uri: &str,
        credential: &Credential,
        properties: BTreeMap<String, String>,
    ) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("xenon-blocking")
            .enable_all()
            .build()
            .map_err(|e| XenonError::Config(format!("cannot start async runtime: {}", e)))?;

        let inner = runtime.block_on(registry.create_scheduler_from_uri(
            uri,
            credential,
            properties,
        ))?;
        Ok(Self { inner, runtime })
    }

    pub fn adaptor_name(&self) -> &str {
        self.inner.adaptor_name()
    }

    pub fn capabilities(&self) -> SchedulerCapabilities {
        self.inner.capabilities()
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn polling_delay(&self) -> Duration {
        self.inner.polling_delay()
    }

    pub fn queue_names(&self) -> Result<Vec<String>> {
        self.runtime.block_on(self.inner.queue_names())
    }

    pub fn get_jobs(&self, queues: &[String]) -> Result<Vec<String>> {
        self.runtime.block_on(self.inner.get_jobs(queues))
    }

    pub fn submit_batch_job(&self, description: &JobDescription) -> Result<String> {
        self.runtime
            .block_on(self.inner.submit_batch_job(description))
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<JobStatus> {
        self.runtime.block_on(self.inner.get_job_status(job_id))
    }

    pub fn get_job_statuses(&self, job_ids: &[String]) -> Vec<JobStatus> {
        self.runtime.block_on(self.inner.get_job_statuses(job_ids))
    }

    /// Block until the job is done or `timeout_millis` passes (0 = forever)
    pub fn wait_until_done(&self, job_id: &str, timeout_millis: i64) -> Result<JobStatus> {
        self.runtime
            .block_on(self.inner.wait_until_done(job_id, timeout_millis))
    }

    pub fn wait_until_running(&self, job_id: &str, timeout_millis: i64) -> Result<JobStatus> {
        self.runtime
            .block_on(self.inner.wait_until_running(job_id, timeout_millis))
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<JobStatus> {
        self.runtime.block_on(self.inner.cancel_job(job_id))
    }

    pub fn close(&self) -> Result<()> {
        self.runtime.block_on(self.inner.close())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("adaptor", &self.inner.adaptor_name())
            .field("id", &self.inner.scheduler_id())
            .finish()
    }
}
