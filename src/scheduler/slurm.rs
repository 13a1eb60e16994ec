//! Slurm adaptor
//!
//! Jobs are submitted with `sbatch`, tracked with `squeue` while queued or
//! running and with `sacct` once they have left the queue, cancelled with
//! `scancel`. Interactive jobs run through `srun`.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;
use xenon_core_interface::CommandLine;

use super::description::{JobDescription, JobTask};
use super::script::{self, render_script, DISCARD};
use super::scripting::{BatchSystem, RawStatus, SchedulerConnection, ScriptingScheduler, StateClass};
use super::{scheduler_properties, Scheduler};
use crate::credential::Credential;
use crate::error::{Result, XenonError};
use crate::properties::{Properties, PropertyDescription, PropertyType};
use crate::registry::{AdaptorDescriptor, SchedulerAdaptor};

pub const NAME: &str = "slurm";

/// Skip `sacct` when the cluster runs without accounting
pub const DISABLE_ACCOUNTING: &str = "slurm.disable_accounting";

static PROPERTIES: &[PropertyDescription] = scheduler_properties![PropertyDescription::new(
    DISABLE_ACCOUNTING,
    PropertyType::Boolean,
    Some("false"),
    "Do not query sacct for jobs that have left the queue",
)];

pub static DESCRIPTOR: AdaptorDescriptor = AdaptorDescriptor {
    name: NAME,
    description: "Submits jobs to a Slurm cluster, locally or over SSH",
    schemes: &["slurm"],
    location_patterns: &["", "local://", "[user@]host[:port]", "ssh://[user@]host[:port]"],
    properties: PROPERTIES,
};

static SUBMITTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Submitted batch job (\d+)").expect("valid regex"));

const QUEUE_FORMAT: &str = "--format=%i|%P|%T|%j|%r";

/// Slurm command vocabulary
#[derive(Debug, Clone, Copy)]
pub struct Slurm {
    accounting: bool,
}

impl Slurm {
    pub fn new(accounting: bool) -> Self {
        Self { accounting }
    }

    /// Resource options shared by `sbatch` and `srun`
    fn resource_options(description: &JobDescription) -> Vec<String> {
        let mut options = vec![format!(
            "--job-name={}",
            description.name.as_deref().unwrap_or("xenon")
        )];
        if let Some(queue) = &description.queue_name {
            options.push(format!("--partition={}", queue));
        }
        options.push(format!("--nodes={}", description.node_count));
        options.push(format!("--ntasks-per-node={}", description.processes_per_node));
        options.push(format!("--cpus-per-task={}", description.cores_per_task));
        if let Some(minutes) = description.max_runtime_minutes {
            options.push(format!("--time={}", minutes));
        }
        if let Some(dir) = &description.working_directory {
            options.push(format!("--chdir={}", dir));
        }
        options
    }

    /// Everything `sbatch` needs besides the task itself
    fn batch_options(description: &JobDescription) -> Vec<String> {
        let mut options = Self::resource_options(description);
        if let Some(stdin) = &description.stdin {
            options.push(format!("--input={}", stdin));
        }
        options.push(format!(
            "--output={}",
            description.stdout.as_deref().unwrap_or(DISCARD)
        ));
        options.push(format!(
            "--error={}",
            description.stderr.as_deref().unwrap_or(DISCARD)
        ));
        options
    }

    fn submit_command(description: &JobDescription) -> Result<(CommandLine, Option<String>)> {
        let scheduler_arguments = description.scheduler_arguments.iter().cloned();

        match &description.task {
            Some(JobTask::Script { path }) => {
                let mut command = CommandLine::new("sbatch")
                    .args(Self::batch_options(description))
                    .args(scheduler_arguments);
                if !description.environment.is_empty() {
                    let exports: Vec<String> = description
                        .environment
                        .iter()
                        .map(|(k, v)| format!("{}={}", k, v))
                        .collect();
                    command = command.arg(format!("--export=ALL,{}", exports.join(",")));
                }
                Ok((command.arg(path.clone()), None))
            }
            _ => {
                let script = render_script(
                    NAME,
                    "#SBATCH",
                    &Self::batch_options(description),
                    description,
                )?;
                let command = CommandLine::new("sbatch").args(scheduler_arguments);
                Ok((command, Some(script)))
            }
        }
    }
}

/// `123|batch|RUNNING|name|None` lines from squeue
fn parse_queue_line(line: &str, job_id: &str) -> Option<RawStatus> {
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() < 5 || fields[0] != job_id {
        return None;
    }

    let mut info = BTreeMap::new();
    info.insert("partition".to_string(), fields[1].to_string());
    info.insert("reason".to_string(), fields[4].to_string());

    let reason = match fields[4] {
        "" | "None" => None,
        other => Some(other.to_string()),
    };

    Some(RawStatus {
        state: fields[2].to_string(),
        exit_code: None,
        name: Some(fields[3].to_string()),
        reason,
        info,
    })
}

/// `123|name|COMPLETED|0:0|` lines from `sacct -p`
fn parse_accounting_line(line: &str, job_id: &str) -> Option<RawStatus> {
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() < 4 || fields[0] != job_id {
        return None;
    }

    // "CANCELLED by 1000"
    let state = fields[2].split_whitespace().next().unwrap_or("").to_string();

    let mut info = BTreeMap::new();
    info.insert("state".to_string(), fields[2].to_string());
    info.insert("exit_code".to_string(), fields[3].to_string());

    let (code, signal) = fields[3].split_once(':').unwrap_or((fields[3], "0"));
    let exit_code = match (code.parse::<i32>().ok(), signal.parse::<i32>().unwrap_or(0)) {
        (_, signal) if signal > 0 => Some(128 + signal),
        (code, _) => code,
    };

    Some(RawStatus {
        state,
        exit_code,
        name: Some(fields[1].to_string()),
        reason: None,
        info,
    })
}

/// `sinfo --format=%P` output: one partition per line, default marked with `*`
fn parse_partitions(output: &str) -> (Vec<String>, Option<String>) {
    let mut names = Vec::new();
    let mut default = None;
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let name = line.trim_end_matches('*').to_string();
        if line.ends_with('*') {
            default = Some(name.clone());
        }
        if !names.contains(&name) {
            names.push(name);
        }
    }
    (names, default)
}

#[async_trait]
impl BatchSystem for Slurm {
    fn name(&self) -> &'static str {
        NAME
    }

    fn supports_interactive(&self) -> bool {
        true
    }

    fn validate(&self, description: &JobDescription) -> Result<()> {
        description.check_job_options(NAME, &[])
    }

    async fn submit(
        &self,
        connection: &SchedulerConnection,
        description: &JobDescription,
    ) -> Result<String> {
        let (command, script) = Self::submit_command(description)?;
        let result = connection.run_checked(script.as_deref(), &command).await?;

        SUBMITTED
            .captures(result.stdout())
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| XenonError::UnexpectedOutput {
                adaptor: NAME.to_string(),
                command: result.command().to_string(),
                output: result.stdout().trim().to_string(),
            })
    }

    async fn query_queue(
        &self,
        connection: &SchedulerConnection,
        job_id: &str,
    ) -> Result<Option<RawStatus>> {
        let command = CommandLine::new("squeue")
            .arg("--noheader")
            .arg(QUEUE_FORMAT)
            .arg("-j")
            .arg(job_id);
        let result = connection.run(None, &command).await?;

        if !result.success_ignoring_stderr() {
            // squeue refuses ids it no longer knows
            if result.stderr().contains("Invalid job id") {
                return Ok(None);
            }
            return Err(result.failure());
        }

        Ok(result
            .stdout()
            .lines()
            .find_map(|line| parse_queue_line(line, job_id)))
    }

    fn has_accounting(&self) -> bool {
        self.accounting
    }

    async fn query_accounting(
        &self,
        connection: &SchedulerConnection,
        job_id: &str,
    ) -> Result<Option<RawStatus>> {
        let command = CommandLine::new("sacct")
            .args(["-X", "-p", "-n", "-j", job_id])
            .arg("--format=JobID,JobName,State,ExitCode");
        let result = connection.run(None, &command).await?;

        if !result.success_ignoring_stderr() {
            debug!(job_id, stderr = result.stderr(), "sacct unavailable");
            return Ok(None);
        }

        Ok(result
            .stdout()
            .lines()
            .filter_map(|line| parse_accounting_line(line, job_id))
            .last())
    }

    async fn cancel(&self, connection: &SchedulerConnection, job_id: &str) -> Result<()> {
        connection
            .run_checked(None, &CommandLine::new("scancel").arg(job_id))
            .await?;
        Ok(())
    }

    async fn queues(
        &self,
        connection: &SchedulerConnection,
    ) -> Result<(Vec<String>, Option<String>)> {
        let command = CommandLine::new("sinfo").args(["--noheader", "--format=%P"]);
        let result = connection.run_checked(None, &command).await?;
        Ok(parse_partitions(result.stdout()))
    }

    async fn jobs(
        &self,
        connection: &SchedulerConnection,
        queues: &[String],
    ) -> Result<Vec<String>> {
        let mut command = CommandLine::new("squeue").args(["--noheader", "--format=%i"]);
        if !queues.is_empty() {
            command = command.arg(format!("--partition={}", queues.join(",")));
        }
        let result = connection.run_checked(None, &command).await?;
        Ok(result
            .stdout()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn classify(&self, raw: &RawStatus) -> StateClass {
        let state = raw.state.trim_end_matches('+');
        match state {
            "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED"
            | "RESV_DEL_HOLD" => StateClass::Pending,
            "RUNNING" | "COMPLETING" | "SUSPENDED" | "STOPPED" | "SIGNALING" | "STAGE_OUT"
            | "RESIZING" => StateClass::Running,
            "COMPLETED" => StateClass::Done,
            "CANCELLED" => StateClass::Cancelled,
            // The job ran and exited non-zero: the exit code says it all
            "FAILED" if raw.exit_code.is_some() => StateClass::Done,
            "FAILED" | "TIMEOUT" | "NODE_FAIL" | "PREEMPTED" | "BOOT_FAIL" | "DEADLINE"
            | "OUT_OF_MEMORY" | "SPECIAL_EXIT" | "REVOKED" => StateClass::Failed,
            _ => StateClass::Unknown,
        }
    }

    fn interactive_command(&self, description: &JobDescription) -> Result<CommandLine> {
        let task = script::interactive_command(NAME, description)?;
        let mut command = CommandLine::new("srun")
            .args(Self::resource_options(description))
            .args(description.scheduler_arguments.iter().cloned())
            .arg(task.executable)
            .args(task.arguments);
        command.environment = task.environment;
        command.working_directory = task.working_directory;
        Ok(command)
    }
}

/// Registry entry for Slurm
#[derive(Debug, Default)]
pub struct SlurmAdaptor;

#[async_trait]
impl SchedulerAdaptor for SlurmAdaptor {
    fn descriptor(&self) -> &'static AdaptorDescriptor {
        &DESCRIPTOR
    }

    async fn create_scheduler(
        &self,
        location: &str,
        credential: &Credential,
        properties: Properties,
    ) -> Result<Box<dyn Scheduler>> {
        let accounting = !properties.get_bool(DISABLE_ACCOUNTING)?;
        let connection = SchedulerConnection::open(NAME, location, credential, properties).await?;
        Ok(Box::new(ScriptingScheduler::new(
            Slurm::new(accounting),
            connection,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::scripting::tests::mock_connection;
    use crate::status::JobFailure;
    use crate::transport::mock::{MockResponse, MockTransport};
    use std::sync::Arc;

    fn slurm(transport: Arc<MockTransport>) -> ScriptingScheduler<Slurm> {
        ScriptingScheduler::new(Slurm::new(true), mock_connection(NAME, PROPERTIES, transport))
    }

    #[tokio::test]
    async fn test_submit_renders_script() {
        let transport = MockTransport::new();
        transport.on("sbatch", MockResponse::ok("Submitted batch job 1234\n"));
        let scheduler = slurm(transport.clone());

        let description = JobDescription::command("/bin/hostname", ["-f"])
            .with_name("probe")
            .with_queue("short")
            .with_max_runtime(15)
            .with_stdout("probe.out")
            .with_env("MODE", "test");

        let job = scheduler.submit_batch_job(&description).await.unwrap();
        assert_eq!(job, "1234");

        let script = transport.stdin_of("sbatch").unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("#SBATCH --job-name=probe\n"));
        assert!(script.contains("#SBATCH --partition=short\n"));
        assert!(script.contains("#SBATCH --time=15\n"));
        assert!(script.contains("#SBATCH --output=probe.out\n"));
        assert!(script.contains("#SBATCH --error=/dev/null\n"));
        assert!(script.contains("export MODE=test\n"));
        assert!(script.ends_with("/bin/hostname -f\n"));
    }

    #[tokio::test]
    async fn test_submit_script_task_passes_path() {
        let transport = MockTransport::new();
        transport.on("sbatch", MockResponse::ok("Submitted batch job 99\n"));
        let scheduler = slurm(transport.clone());

        let description = JobDescription::script("run.sh");
        scheduler.submit_batch_job(&description).await.unwrap();

        let command = transport.commands().pop().unwrap();
        assert!(command.starts_with("sbatch --job-name=xenon"));
        assert!(command.ends_with(" run.sh"));
        assert_eq!(transport.stdin_of("sbatch").as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_submit_unexpected_output() {
        let transport = MockTransport::new();
        transport.on("sbatch", MockResponse::ok("nothing to see\n"));
        let scheduler = slurm(transport);

        let err = scheduler
            .submit_batch_job(&JobDescription::command("true", Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, XenonError::UnexpectedOutput { .. }));
        assert!(err.to_string().starts_with("slurm adaptor:"));
    }

    #[tokio::test]
    async fn test_submit_rejected_by_sbatch() {
        let transport = MockTransport::new();
        transport.on(
            "sbatch",
            MockResponse::fail(1, "sbatch: error: invalid partition specified: nope\n"),
        );
        let scheduler = slurm(transport);

        let err = scheduler
            .submit_batch_job(&JobDescription::command("true", Vec::<String>::new()).with_queue("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, XenonError::CommandFailed { exit_code: 1, .. }));
    }

    #[tokio::test]
    async fn test_status_from_queue() {
        let transport = MockTransport::new();
        transport.on(
            "squeue",
            MockResponse::ok("1234|short|RUNNING|probe|None\n"),
        );
        let scheduler = slurm(transport);

        let status = scheduler.get_job_status("1234").await.unwrap();
        assert!(status.is_running());
        assert_eq!(status.name(), Some("probe"));
        assert_eq!(status.state(), "RUNNING");
        assert_eq!(
            status.scheduler_info().get("partition").map(String::as_str),
            Some("short")
        );
    }

    #[tokio::test]
    async fn test_status_falls_back_to_accounting() {
        let transport = MockTransport::new();
        transport
            .on("squeue", MockResponse::fail(1, "slurm_load_jobs error: Invalid job id specified\n"))
            .on("sacct", MockResponse::ok("1234|probe|FAILED|3:0|\n"));
        let scheduler = slurm(transport);

        let status = scheduler.get_job_status("1234").await.unwrap();
        assert!(status.is_done());
        assert_eq!(status.exit_code(), Some(3));
        assert!(!status.has_exception());
    }

    #[tokio::test]
    async fn test_accounting_cancelled_and_timeout() {
        let transport = MockTransport::new();
        transport
            .on("squeue", MockResponse::ok(""))
            .on("-j 1 ", MockResponse::ok("1|a|CANCELLED by 1000|0:15|\n"))
            .on("-j 2 ", MockResponse::ok("2|b|TIMEOUT|0:0|\n"));
        let scheduler = slurm(transport);

        let cancelled = scheduler.get_job_status("1").await.unwrap();
        assert!(cancelled.is_done());
        assert!(cancelled.failure().unwrap().is_cancellation());
        assert_eq!(cancelled.exit_code(), Some(143));

        let timed_out = scheduler.get_job_status("2").await.unwrap();
        assert!(timed_out.is_done());
        assert!(matches!(
            timed_out.failure(),
            Some(JobFailure::SchedulerReported { state, .. }) if state == "TIMEOUT"
        ));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let transport = MockTransport::new();
        transport
            .on("squeue", MockResponse::ok(""))
            .on("sacct", MockResponse::ok(""));
        let scheduler = slurm(transport);

        let err = scheduler.get_job_status("555").await.unwrap_err();
        assert!(matches!(err, XenonError::NoSuchJob { .. }));
    }

    #[tokio::test]
    async fn test_without_accounting_left_jobs_are_done() {
        let transport = MockTransport::new();
        transport.on("squeue", MockResponse::ok(""));
        let scheduler = ScriptingScheduler::new(
            Slurm::new(false),
            mock_connection(NAME, PROPERTIES, transport.clone()),
        );

        let status = scheduler.get_job_status("555").await.unwrap();
        assert!(status.is_done());
        assert_eq!(status.exit_code(), None);
        assert_eq!(transport.count("sacct"), 0);
    }

    #[tokio::test]
    async fn test_cancel_issues_scancel() {
        let transport = MockTransport::new();
        transport
            .on("squeue", MockResponse::ok("77|short|PENDING|job|Priority\n"))
            .on("squeue", MockResponse::ok("77|short|PENDING|job|Priority\n"))
            .on("squeue", MockResponse::ok(""))
            .on("sacct", MockResponse::ok("77|job|CANCELLED by 1000|0:0|\n"))
            .on("scancel", MockResponse::ok(""));
        let scheduler = slurm(transport.clone());

        let requested = scheduler.cancel_job("77").await.unwrap();
        assert!(!requested.is_done());
        assert_eq!(transport.count("scancel 77"), 1);

        let status = scheduler.wait_until_done("77", 5_000).await.unwrap();
        assert!(status.is_done());
        assert!(status.failure().unwrap().is_cancellation());
    }

    #[tokio::test]
    async fn test_queues() {
        let transport = MockTransport::new();
        transport
            .on("sinfo", MockResponse::ok("batch*\ndebug\nbatch*\n"))
            .on("squeue", MockResponse::ok("11\n12\n"));
        let scheduler = slurm(transport.clone());

        assert_eq!(scheduler.queue_names().await.unwrap(), vec!["batch", "debug"]);
        assert_eq!(
            scheduler.default_queue_name().await.unwrap().as_deref(),
            Some("batch")
        );
        assert_eq!(
            scheduler.get_jobs(&["debug".to_string()]).await.unwrap(),
            vec!["11", "12"]
        );
        assert_eq!(transport.count("--partition=debug"), 1);
    }

    #[test]
    fn test_classify() {
        let slurm = Slurm::new(true);
        let raw = |state: &str, exit_code: Option<i32>| RawStatus {
            state: state.to_string(),
            exit_code,
            ..Default::default()
        };

        assert_eq!(slurm.classify(&raw("PENDING", None)), StateClass::Pending);
        assert_eq!(slurm.classify(&raw("COMPLETING", None)), StateClass::Running);
        assert_eq!(slurm.classify(&raw("COMPLETED", Some(0))), StateClass::Done);
        assert_eq!(slurm.classify(&raw("FAILED", Some(2))), StateClass::Done);
        assert_eq!(slurm.classify(&raw("FAILED", None)), StateClass::Failed);
        assert_eq!(slurm.classify(&raw("NODE_FAIL", None)), StateClass::Failed);
        assert_eq!(slurm.classify(&raw("CANCELLED+", None)), StateClass::Cancelled);
        assert_eq!(slurm.classify(&raw("WEIRD", None)), StateClass::Unknown);
    }

    #[test]
    fn test_interactive_command() {
        let description = JobDescription::command("cat", Vec::<String>::new())
            .with_env("A", "1")
            .with_working_directory("/scratch");
        let command = Slurm::new(true).interactive_command(&description).unwrap();

        assert_eq!(command.executable, "srun");
        assert_eq!(command.arguments.last().map(String::as_str), Some("cat"));
        assert!(command.arguments.contains(&"--chdir=/scratch".to_string()));
        assert_eq!(command.environment.get("A").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_unknown_job_option_rejected() {
        let description = JobDescription::command("true", Vec::<String>::new())
            .with_job_option("parallel.environment", "mpi");
        assert!(Slurm::new(true).validate(&description).is_err());
    }
}
