//! Process schedulers: every job is a process on the transport's host
//!
//! There is no batch system underneath. A job starts as soon as it is
//! submitted, its status is the liveness of its process, and it dies with
//! the session.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xenon_core_interface::{InteractiveProcess, ProcessStreams};

use super::description::JobDescription;
use super::script::{batch_command, interactive_command};
use super::scripting::SchedulerConnection;
use super::{scheduler_properties, InteractiveJob, Scheduler, SchedulerCapabilities};
use crate::credential::Credential;
use crate::error::{Result, XenonError};
use crate::forwarder::StreamForwarder;
use crate::location::TransportLocation;
use crate::properties::{Properties, PropertyDescription};
use crate::registry::{AdaptorDescriptor, SchedulerAdaptor};
use crate::status::{JobFailure, JobStatus};

/// The only queue a process scheduler has
pub const QUEUE: &str = "unlimited";

static PROPERTIES: &[PropertyDescription] = scheduler_properties![];

pub static LOCAL_DESCRIPTOR: AdaptorDescriptor = AdaptorDescriptor {
    name: "local",
    description: "Runs jobs as processes on this machine",
    schemes: &["local"],
    location_patterns: &["", "local://", "/"],
    properties: PROPERTIES,
};

pub static SSH_DESCRIPTOR: AdaptorDescriptor = AdaptorDescriptor {
    name: "ssh",
    description: "Runs jobs as processes on a remote machine over SSH",
    schemes: &["ssh"],
    location_patterns: &["[user@]host[:port]"],
    properties: PROPERTIES,
};

struct ProcessJob {
    name: Option<String>,
    process: Box<dyn InteractiveProcess>,
    cancelled: bool,
    timed_out: bool,
    watchdog: Option<JoinHandle<()>>,
}

impl ProcessJob {
    fn status(&mut self, adaptor: &str, job_id: &str) -> JobStatus {
        let status = if self.cancelled {
            JobStatus::failed(
                job_id,
                "CANCELLED",
                self.process.exit_status(),
                JobFailure::Cancelled {
                    adaptor: adaptor.to_string(),
                    job_id: job_id.to_string(),
                },
            )
        } else if self.process.is_done() {
            let exit_code = self.process.exit_status();
            if self.timed_out {
                JobStatus::failed(
                    job_id,
                    "KILLED",
                    exit_code,
                    JobFailure::SchedulerReported {
                        adaptor: adaptor.to_string(),
                        job_id: job_id.to_string(),
                        state: "KILLED".to_string(),
                        message: "maximum runtime exceeded".to_string(),
                    },
                )
            } else {
                JobStatus::done(job_id, "DONE", exit_code)
            }
        } else {
            JobStatus::running(job_id, "RUNNING")
        };
        status.with_name(self.name.clone())
    }

    fn stop_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

type JobTable = Arc<Mutex<BTreeMap<String, ProcessJob>>>;

/// Scheduler whose jobs are plain processes
pub struct ProcessScheduler {
    connection: SchedulerConnection,
    jobs: JobTable,
    next_job: AtomicU64,
}

impl ProcessScheduler {
    pub fn new(connection: SchedulerConnection) -> Self {
        Self {
            connection,
            jobs: Arc::new(Mutex::new(BTreeMap::new())),
            next_job: AtomicU64::new(1),
        }
    }

    fn adaptor(&self) -> &str {
        self.connection.adaptor()
    }

    fn validate(&self, description: &JobDescription) -> Result<()> {
        let adaptor = self.adaptor();
        description.validate(adaptor)?;
        description.check_job_options(adaptor, &[])?;

        if let Some(queue) = &description.queue_name {
            if queue != QUEUE {
                return Err(XenonError::invalid_job(
                    adaptor,
                    format!("no such queue `{}`", queue),
                ));
            }
        }
        if description.node_count > 1 || description.processes_per_node > 1 {
            return Err(XenonError::invalid_job(
                adaptor,
                "only single-process jobs are supported",
            ));
        }
        if !description.scheduler_arguments.is_empty() {
            return Err(XenonError::invalid_job(
                adaptor,
                "scheduler arguments are not supported",
            ));
        }
        Ok(())
    }

    fn next_job_id(&self) -> String {
        format!(
            "{}-{}",
            self.adaptor(),
            self.next_job.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Kill the job once its maximum runtime has passed
    fn spawn_watchdog(&self, job_id: &str, limit: Duration) -> JoinHandle<()> {
        let jobs = self.jobs.clone();
        let job_id = job_id.to_string();
        let adaptor = self.adaptor().to_string();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let mut jobs = jobs.lock().await;
            if let Some(job) = jobs.get_mut(&job_id) {
                if !job.cancelled && !job.process.is_done() {
                    warn!(adaptor = %adaptor, job_id = %job_id, ?limit, "maximum runtime exceeded, killing job");
                    job.timed_out = true;
                    job.process.destroy().await;
                }
            }
        })
    }

    async fn start(
        &self,
        description: &JobDescription,
        interactive: bool,
    ) -> Result<(String, ProcessStreams)> {
        self.connection.ensure_open()?;
        self.validate(description)?;

        let command = if interactive {
            interactive_command(self.adaptor(), description)?
        } else {
            batch_command(self.adaptor(), description)?
        };
        let mut process = self.connection.launch(&command).await?;
        let streams = process.take_streams();

        let job_id = self.next_job_id();
        let watchdog = description
            .max_runtime_minutes
            .map(|minutes| self.spawn_watchdog(&job_id, Duration::from_secs(u64::from(minutes) * 60)));

        self.jobs.lock().await.insert(
            job_id.clone(),
            ProcessJob {
                name: description.name.clone(),
                process,
                cancelled: false,
                timed_out: false,
                watchdog,
            },
        );
        info!(adaptor = self.adaptor(), job_id = %job_id, interactive, command = %command, "started job");

        Ok((job_id, streams))
    }

    fn no_such_job(&self, job_id: &str) -> XenonError {
        XenonError::NoSuchJob {
            adaptor: self.adaptor().to_string(),
            job_id: job_id.to_string(),
        }
    }
}

#[async_trait]
impl Scheduler for ProcessScheduler {
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
            supports_interactive: true,
            is_embedded: true,
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
        {
            let mut jobs = self.jobs.lock().await;
            for (job_id, job) in jobs.iter_mut() {
                job.stop_watchdog();
                if !job.process.is_done() {
                    debug!(adaptor = self.adaptor(), job_id = %job_id, "killing job on close");
                    job.process.destroy().await;
                }
            }
        }
        self.connection.close().await
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        self.connection.ensure_open()?;
        Ok(vec![QUEUE.to_string()])
    }

    async fn default_queue_name(&self) -> Result<Option<String>> {
        self.connection.ensure_open()?;
        Ok(Some(QUEUE.to_string()))
    }

    async fn get_jobs(&self, queues: &[String]) -> Result<Vec<String>> {
        self.connection.ensure_open()?;
        if let Some(unknown) = queues.iter().find(|q| q.as_str() != QUEUE) {
            return Err(XenonError::invalid_argument(
                self.adaptor(),
                format!("no such queue `{}`", unknown),
            ));
        }
        Ok(self.jobs.lock().await.keys().cloned().collect())
    }

    async fn submit_batch_job(&self, description: &JobDescription) -> Result<String> {
        // Output goes to the files named in the description; whatever the
        // shell itself reports before that is drained, not left on a closed pipe
        let (job_id, streams) = self.start(description, false).await?;
        for (name, output) in [("stdout", streams.stdout), ("stderr", streams.stderr)] {
            if let Some(output) = output {
                // the pump runs detached until the process closes the pipe
                StreamForwarder::discard(name, output);
            }
        }
        Ok(job_id)
    }

    async fn submit_interactive_job(
        &self,
        description: &JobDescription,
    ) -> Result<InteractiveJob> {
        let (job_id, streams) = self.start(description, true).await?;
        Ok(InteractiveJob { job_id, streams })
    }

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatus> {
        self.connection.ensure_open()?;
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(job_id).ok_or_else(|| self.no_such_job(job_id))?;
        let status = job.status(self.adaptor(), job_id);
        if status.is_done() {
            job.stop_watchdog();
        }
        Ok(status)
    }

    async fn cancel_job(&self, job_id: &str) -> Result<JobStatus> {
        self.connection.ensure_open()?;
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(job_id).ok_or_else(|| self.no_such_job(job_id))?;

        if !job.cancelled && !job.process.is_done() {
            job.cancelled = true;
            job.stop_watchdog();
            job.process.destroy().await;
            info!(adaptor = self.adaptor(), job_id, "cancelled job");
        }
        Ok(job.status(self.adaptor(), job_id))
    }

    fn polling_delay(&self) -> Duration {
        self.connection.polling_delay()
    }
}

/// Registry entry for the local process scheduler
#[derive(Debug, Default)]
pub struct LocalSchedulerAdaptor;

#[async_trait]
impl SchedulerAdaptor for LocalSchedulerAdaptor {
    fn descriptor(&self) -> &'static AdaptorDescriptor {
        &LOCAL_DESCRIPTOR
    }

    async fn create_scheduler(
        &self,
        location: &str,
        credential: &Credential,
        properties: Properties,
    ) -> Result<Box<dyn Scheduler>> {
        let adaptor = LOCAL_DESCRIPTOR.name;
        if !TransportLocation::parse(adaptor, location)?.is_local() {
            return Err(XenonError::InvalidLocation {
                adaptor: adaptor.to_string(),
                location: location.to_string(),
                message: "the local adaptor only runs jobs on this machine".to_string(),
            });
        }
        let connection = SchedulerConnection::open(adaptor, location, credential, properties).await?;
        Ok(Box::new(ProcessScheduler::new(connection)))
    }
}

/// Registry entry for the SSH process scheduler
#[cfg(feature = "ssh")]
#[derive(Debug, Default)]
pub struct SshSchedulerAdaptor;

#[cfg(feature = "ssh")]
#[async_trait]
impl SchedulerAdaptor for SshSchedulerAdaptor {
    fn descriptor(&self) -> &'static AdaptorDescriptor {
        &SSH_DESCRIPTOR
    }

    async fn create_scheduler(
        &self,
        location: &str,
        credential: &Credential,
        properties: Properties,
    ) -> Result<Box<dyn Scheduler>> {
        let adaptor = SSH_DESCRIPTOR.name;
        if TransportLocation::parse(adaptor, location)?.is_local() {
            return Err(XenonError::InvalidLocation {
                adaptor: adaptor.to_string(),
                location: location.to_string(),
                message: "expected [user@]host[:port]".to_string(),
            });
        }
        let connection = SchedulerConnection::open(adaptor, location, credential, properties).await?;
        Ok(Box::new(ProcessScheduler::new(connection)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn local() -> ProcessScheduler {
        let mut values = BTreeMap::new();
        values.insert(crate::scheduler::POLL_DELAY.to_string(), "20ms".to_string());
        let properties = Properties::new("local", PROPERTIES, values).unwrap();
        let connection = SchedulerConnection::with_transport(
            "local",
            "",
            Arc::new(LocalTransport::new()),
            properties,
        )
        .unwrap();
        ProcessScheduler::new(connection)
    }

    #[tokio::test]
    async fn test_batch_job_writes_output_file() {
        let dir = TempDir::new().unwrap();
        let scheduler = local();

        let description = JobDescription::command("sh", ["-c", "echo $GREETING; exit 3"])
            .with_env("GREETING", "hello")
            .with_working_directory(dir.path().to_string_lossy())
            .with_stdout("out.txt");

        let job = scheduler.submit_batch_job(&description).await.unwrap();
        let status = scheduler.wait_until_done(&job, 10_000).await.unwrap();

        assert!(status.is_done());
        assert_eq!(status.exit_code(), Some(3));
        assert!(!status.has_exception());
        let output = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(output, "hello\n");
    }

    #[tokio::test]
    async fn test_redirect_failure_reports_shell_exit_status() {
        let dir = TempDir::new().unwrap();
        let scheduler = local();

        let description = JobDescription::command("true", Vec::<String>::new())
            .with_working_directory(dir.path().to_string_lossy())
            .with_stdout("missing/dir/out.txt");

        let job = scheduler.submit_batch_job(&description).await.unwrap();
        let status = scheduler.wait_until_done(&job, 10_000).await.unwrap();

        assert!(status.is_done());
        // sh exits 1 or 2 on a failed redirection
        assert!(
            matches!(status.exit_code(), Some(1) | Some(2)),
            "unexpected exit code {:?}",
            status.exit_code()
        );
    }

    #[tokio::test]
    async fn test_wait_until_done_times_out() {
        let scheduler = local();
        let job = scheduler
            .submit_batch_job(&JobDescription::command("sleep", ["30"]))
            .await
            .unwrap();

        let start = std::time::Instant::now();
        let status = scheduler.wait_until_done(&job, 500).await.unwrap();
        assert!(!status.is_done());
        assert!(status.is_running());
        assert!(start.elapsed() < Duration::from_millis(1500));

        scheduler.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_is_carried_and_idempotent() {
        let scheduler = local();
        let job = scheduler
            .submit_batch_job(&JobDescription::command("sleep", ["30"]))
            .await
            .unwrap();

        let status = scheduler.cancel_job(&job).await.unwrap();
        assert!(status.is_done());
        assert!(status.failure().unwrap().is_cancellation());

        let again = scheduler.cancel_job(&job).await.unwrap();
        assert!(again.is_done());
        assert!(again.maybe_raise().is_err());
    }

    #[tokio::test]
    async fn test_cancel_finished_job_is_noop() {
        let scheduler = local();
        let job = scheduler
            .submit_batch_job(&JobDescription::command("true", Vec::<String>::new()))
            .await
            .unwrap();
        scheduler.wait_until_done(&job, 10_000).await.unwrap();

        let status = scheduler.cancel_job(&job).await.unwrap();
        assert!(status.is_done());
        assert!(!status.has_exception());
        assert_eq!(status.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_interactive_job_streams() {
        let scheduler = local();
        let job = scheduler
            .submit_interactive_job(&JobDescription::command("cat", Vec::<String>::new()))
            .await
            .unwrap();

        let mut stdin = job.streams.stdin.unwrap();
        stdin.write_all(b"ping\n").await.unwrap();
        drop(stdin);

        let mut output = String::new();
        job.streams
            .stdout
            .unwrap()
            .read_to_string(&mut output)
            .await
            .unwrap();
        assert_eq!(output, "ping\n");

        let status = scheduler.wait_until_done(&job.job_id, 10_000).await.unwrap();
        assert_eq!(status.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_validation() {
        let scheduler = local();

        let wrong_queue = JobDescription::command("true", Vec::<String>::new()).with_queue("fast");
        assert!(matches!(
            scheduler.submit_batch_job(&wrong_queue).await.unwrap_err(),
            XenonError::InvalidJobDescription { .. }
        ));

        let mut multi_node = JobDescription::command("true", Vec::<String>::new());
        multi_node.node_count = 2;
        assert!(scheduler.submit_batch_job(&multi_node).await.is_err());

        let missing = JobDescription::command("/nonexistent/binary", Vec::<String>::new());
        let job = scheduler.submit_batch_job(&missing).await.unwrap();
        // The shell starts, the command inside it does not
        let status = scheduler.wait_until_done(&job, 10_000).await.unwrap();
        assert_eq!(status.exit_code(), Some(127));
    }

    #[tokio::test]
    async fn test_interactive_launch_failure_names_adaptor() {
        let scheduler = local();
        let err = scheduler
            .submit_interactive_job(&JobDescription::command(
                "/nonexistent/binary",
                Vec::<String>::new(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, XenonError::ProcessLaunch { .. }));
        assert_eq!(err.adaptor(), Some("local"));
    }

    #[tokio::test]
    async fn test_queues_jobs_and_close() {
        let scheduler = local();
        assert_eq!(scheduler.queue_names().await.unwrap(), vec![QUEUE]);
        assert_eq!(
            scheduler.default_queue_name().await.unwrap().as_deref(),
            Some(QUEUE)
        );

        let job = scheduler
            .submit_batch_job(&JobDescription::command("sleep", ["30"]))
            .await
            .unwrap();
        assert_eq!(scheduler.get_jobs(&[]).await.unwrap(), vec![job.clone()]);
        assert!(scheduler.get_jobs(&["other".to_string()]).await.is_err());
        assert!(matches!(
            scheduler.get_job_status("local-999").await.unwrap_err(),
            XenonError::NoSuchJob { .. }
        ));

        scheduler.close().await.unwrap();
        assert!(scheduler.get_job_status(&job).await.unwrap_err().is_closed());
        assert!(scheduler.close().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_local_adaptor_rejects_remote_location() {
        let err = LocalSchedulerAdaptor
            .create_scheduler(
                "cluster.example.com",
                &Credential::Default,
                Properties::empty("local", PROPERTIES),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, XenonError::InvalidLocation { .. }));
    }
}
