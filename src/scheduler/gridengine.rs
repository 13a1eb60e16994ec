//! Grid Engine adaptor
//!
//! Covers Sun/Oracle/Univa Grid Engine and Son of Grid Engine: `qsub` to
//! submit, `qstat` for queued and running jobs, `qacct` for finished ones,
//! `qdel` to cancel. Multi-process jobs need a parallel environment, named
//! through the `parallel.environment` job option.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;
use xenon_core_interface::CommandLine;

use super::description::{JobDescription, JobTask};
use super::script::{directive_lines, render_script, DISCARD};
use super::scripting::{BatchSystem, RawStatus, SchedulerConnection, ScriptingScheduler, StateClass};
use super::{scheduler_properties, Scheduler};
use crate::credential::Credential;
use crate::error::{Result, XenonError};
use crate::properties::{Properties, PropertyDescription};
use crate::registry::{AdaptorDescriptor, SchedulerAdaptor};

pub const NAME: &str = "gridengine";

/// Job option naming the parallel environment for multi-process jobs
pub const PARALLEL_ENVIRONMENT: &str = "parallel.environment";
/// Job option overriding the number of slots requested from the parallel environment
pub const PARALLEL_SLOTS: &str = "parallel.slots";

const JOB_OPTIONS: &[&str] = &[PARALLEL_ENVIRONMENT, PARALLEL_SLOTS];

static PROPERTIES: &[PropertyDescription] = scheduler_properties![];

pub static DESCRIPTOR: AdaptorDescriptor = AdaptorDescriptor {
    name: NAME,
    description: "Submits jobs to a Grid Engine cluster, locally or over SSH",
    schemes: &["ge", "sge", "gridengine"],
    location_patterns: &["", "local://", "[user@]host[:port]", "ssh://[user@]host[:port]"],
    properties: PROPERTIES,
};

static SUBMITTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Your job(?:-array)? (\d+)").expect("valid regex"));

/// Grid Engine command vocabulary
#[derive(Debug, Clone, Copy, Default)]
pub struct GridEngine;

impl GridEngine {
    fn options(description: &JobDescription) -> Result<Vec<Vec<String>>> {
        let word = |s: &str| s.to_string();
        let mut options = vec![
            vec![word("-S"), word("/bin/sh")],
            vec![
                word("-N"),
                description.name.clone().unwrap_or_else(|| word("xenon")),
            ],
        ];

        match &description.working_directory {
            Some(dir) => options.push(vec![word("-wd"), dir.clone()]),
            None => options.push(vec![word("-cwd")]),
        }

        if let Some(queue) = &description.queue_name {
            options.push(vec![word("-q"), queue.clone()]);
        }

        if let Some(environment) = description.job_options.get(PARALLEL_ENVIRONMENT) {
            let slots = match description.job_options.get(PARALLEL_SLOTS) {
                Some(raw) => raw.parse::<u64>().map_err(|_| {
                    XenonError::invalid_job(
                        NAME,
                        format!("{} must be a positive number, got `{}`", PARALLEL_SLOTS, raw),
                    )
                })?,
                None => description.total_processes() * u64::from(description.cores_per_task),
            };
            options.push(vec![word("-pe"), environment.clone(), slots.to_string()]);
        }

        if let Some(minutes) = description.max_runtime_minutes {
            options.push(vec![
                word("-l"),
                format!("h_rt={:02}:{:02}:00", minutes / 60, minutes % 60),
            ]);
        }

        if let Some(stdin) = &description.stdin {
            options.push(vec![word("-i"), stdin.clone()]);
        }
        options.push(vec![
            word("-o"),
            description.stdout.clone().unwrap_or_else(|| word(DISCARD)),
        ]);
        options.push(vec![
            word("-e"),
            description.stderr.clone().unwrap_or_else(|| word(DISCARD)),
        ]);

        Ok(options)
    }
}

/// Rows of `qstat` output below the dashed header
fn parse_qstat(output: &str) -> Vec<RawStatus> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return None;
            }

            let mut info = BTreeMap::new();
            info.insert("job_id".to_string(), fields[0].to_string());
            info.insert("user".to_string(), fields[3].to_string());
            // The queue column is empty while the job waits
            if fields.len() >= 9 {
                info.insert("queue".to_string(), fields[7].to_string());
                info.insert("slots".to_string(), fields[8].to_string());
            } else if fields.len() == 8 {
                info.insert("slots".to_string(), fields[7].to_string());
            }

            Some(RawStatus {
                state: fields[4].to_string(),
                exit_code: None,
                name: Some(fields[2].to_string()),
                reason: None,
                info,
            })
        })
        .collect()
}

/// Last record of `qacct -j` output
fn parse_qacct(output: &str) -> Option<RawStatus> {
    let mut records: Vec<BTreeMap<String, String>> = Vec::new();
    for line in output.lines().map(str::trim) {
        if line.starts_with("===") {
            records.push(BTreeMap::new());
            continue;
        }
        let Some((key, value)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        if records.is_empty() {
            records.push(BTreeMap::new());
        }
        if let Some(record) = records.last_mut() {
            record.insert(key.to_string(), value.trim().to_string());
        }
    }
    let info = records.into_iter().filter(|r| !r.is_empty()).last()?;

    let exit_code = info.get("exit_status").and_then(|v| v.parse::<i32>().ok());
    let failed = info
        .get("failed")
        .map(String::as_str)
        .unwrap_or("0")
        .to_string();

    let (state, reason) = if failed == "0" {
        ("DONE".to_string(), None)
    } else {
        ("FAILED".to_string(), Some(format!("failed {}", failed)))
    };

    Some(RawStatus {
        state,
        exit_code,
        name: info.get("jobname").cloned(),
        reason,
        info,
    })
}

#[async_trait]
impl BatchSystem for GridEngine {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validate(&self, description: &JobDescription) -> Result<()> {
        description.check_job_options(NAME, JOB_OPTIONS)?;

        let parallel = description.total_processes() > 1 || description.cores_per_task > 1;
        if parallel && !description.job_options.contains_key(PARALLEL_ENVIRONMENT) {
            return Err(XenonError::invalid_job(
                NAME,
                format!(
                    "multi-process jobs need the `{}` job option",
                    PARALLEL_ENVIRONMENT
                ),
            ));
        }
        Self::options(description).map(|_| ())
    }

    async fn submit(
        &self,
        connection: &SchedulerConnection,
        description: &JobDescription,
    ) -> Result<String> {
        let options = Self::options(description)?;
        let scheduler_arguments = description.scheduler_arguments.iter().cloned();

        let (command, script) = match &description.task {
            Some(JobTask::Script { path }) => {
                let mut command = CommandLine::new("qsub")
                    .args(options.into_iter().flatten())
                    .args(scheduler_arguments);
                for (key, value) in &description.environment {
                    command = command.arg("-v").arg(format!("{}={}", key, value));
                }
                (command.arg(path.clone()), None)
            }
            _ => {
                let script = render_script(NAME, "#$", &directive_lines(&options), description)?;
                (CommandLine::new("qsub").args(scheduler_arguments), Some(script))
            }
        };

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
        let command = CommandLine::new("qstat").args(["-u", "*"]);
        let result = connection.run_checked(None, &command).await?;
        Ok(parse_qstat(result.stdout())
            .into_iter()
            .find(|raw| raw.info.get("job_id").map(String::as_str) == Some(job_id)))
    }

    fn has_accounting(&self) -> bool {
        true
    }

    async fn query_accounting(
        &self,
        connection: &SchedulerConnection,
        job_id: &str,
    ) -> Result<Option<RawStatus>> {
        let command = CommandLine::new("qacct").args(["-j", job_id]);
        let result = connection.run(None, &command).await?;
        if !result.success_ignoring_stderr() {
            debug!(job_id, stderr = result.stderr().trim(), "no accounting record");
            return Ok(None);
        }
        Ok(parse_qacct(result.stdout()))
    }

    async fn cancel(&self, connection: &SchedulerConnection, job_id: &str) -> Result<()> {
        connection
            .run_checked(None, &CommandLine::new("qdel").arg(job_id))
            .await?;
        Ok(())
    }

    async fn queues(
        &self,
        connection: &SchedulerConnection,
    ) -> Result<(Vec<String>, Option<String>)> {
        let result = connection
            .run_checked(None, &CommandLine::new("qconf").arg("-sql"))
            .await?;
        let names = result
            .stdout()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Ok((names, None))
    }

    async fn jobs(
        &self,
        connection: &SchedulerConnection,
        queues: &[String],
    ) -> Result<Vec<String>> {
        let mut command = CommandLine::new("qstat").args(["-u", "*"]);
        if !queues.is_empty() {
            command = command.arg("-q").arg(queues.join(","));
        }
        let result = connection.run_checked(None, &command).await?;
        Ok(parse_qstat(result.stdout())
            .into_iter()
            .filter_map(|raw| raw.info.get("job_id").cloned())
            .collect())
    }

    fn classify(&self, raw: &RawStatus) -> StateClass {
        let state = raw.state.as_str();
        match state {
            "DONE" => StateClass::Done,
            "FAILED" => StateClass::Failed,
            _ if state.contains('E') => StateClass::Failed,
            _ if state.contains('q') || state.contains('w') => StateClass::Pending,
            _ if state.chars().any(|c| "rtRsSTd".contains(c)) => StateClass::Running,
            _ if state.contains('h') => StateClass::Pending,
            _ => StateClass::Unknown,
        }
    }
}

/// Registry entry for Grid Engine
#[derive(Debug, Default)]
pub struct GridEngineAdaptor;

#[async_trait]
impl SchedulerAdaptor for GridEngineAdaptor {
    fn descriptor(&self) -> &'static AdaptorDescriptor {
        &DESCRIPTOR
    }

    async fn create_scheduler(
        &self,
        location: &str,
        credential: &Credential,
        properties: Properties,
    ) -> Result<Box<dyn Scheduler>> {
        let connection = SchedulerConnection::open(NAME, location, credential, properties).await?;
        Ok(Box::new(ScriptingScheduler::new(GridEngine, connection)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::scripting::tests::mock_connection;
    use crate::status::JobFailure;
    use crate::transport::mock::{MockResponse, MockTransport};
    use std::sync::Arc;

    const QSTAT: &str = "\
job-ID  prior   name       user         state submit/start at     queue                          slots ja-task-ID
-----------------------------------------------------------------------------------------------------------------
    101 0.55500 sleep      alice        r     05/01/2024 10:00:00 all.q@node1                        1
    102 0.00000 sleep      alice        qw    05/01/2024 10:00:05                                    1
    103 0.00000 broken     alice        Eqw   05/01/2024 10:00:09                                    1
";

    const QACCT: &str = "\
==============================================================
qname        all.q
hostname     node1
jobname      sleep
jobnumber    104
failed       0
exit_status  2
";

    fn gridengine(transport: Arc<MockTransport>) -> ScriptingScheduler<GridEngine> {
        ScriptingScheduler::new(GridEngine, mock_connection(NAME, PROPERTIES, transport))
    }

    #[tokio::test]
    async fn test_submit_renders_directives() {
        let transport = MockTransport::new();
        transport.on(
            "qsub",
            MockResponse::ok("Your job 4711 (\"xenon\") has been submitted\n"),
        );
        let scheduler = gridengine(transport.clone());

        let mut description = JobDescription::command("mpirun", ["./solver"])
            .with_queue("all.q")
            .with_max_runtime(90)
            .with_job_option(PARALLEL_ENVIRONMENT, "mpi");
        description.node_count = 2;
        description.processes_per_node = 4;

        let job = scheduler.submit_batch_job(&description).await.unwrap();
        assert_eq!(job, "4711");

        let script = transport.stdin_of("qsub").unwrap();
        assert!(script.contains("#$ -S /bin/sh\n"));
        assert!(script.contains("#$ -N xenon\n"));
        assert!(script.contains("#$ -cwd\n"));
        assert!(script.contains("#$ -q all.q\n"));
        assert!(script.contains("#$ -pe mpi 8\n"));
        assert!(script.contains("#$ -l h_rt=01:30:00\n"));
        assert!(script.contains("#$ -o /dev/null\n"));
        assert!(script.ends_with("mpirun ./solver\n"));
    }

    #[tokio::test]
    async fn test_parallel_job_requires_environment() {
        let transport = MockTransport::new();
        let scheduler = gridengine(transport.clone());

        let mut description = JobDescription::command("mpirun", ["./solver"]);
        description.processes_per_node = 4;

        let err = scheduler.submit_batch_job(&description).await.unwrap_err();
        assert!(matches!(err, XenonError::InvalidJobDescription { .. }));
        assert!(transport.commands().is_empty());

        let bad_slots = JobDescription::command("true", Vec::<String>::new())
            .with_job_option(PARALLEL_ENVIRONMENT, "mpi")
            .with_job_option(PARALLEL_SLOTS, "many");
        assert!(scheduler.submit_batch_job(&bad_slots).await.is_err());
    }

    #[tokio::test]
    async fn test_script_submission() {
        let transport = MockTransport::new();
        transport.on("qsub", MockResponse::ok("Your job 12 (\"job.sh\") has been submitted\n"));
        let scheduler = gridengine(transport.clone());

        let description = JobDescription::script("job.sh").with_env("MODE", "fast");
        assert_eq!(scheduler.submit_batch_job(&description).await.unwrap(), "12");

        let command = transport.commands().pop().unwrap();
        assert!(command.starts_with("qsub -S /bin/sh -N xenon -cwd"));
        assert!(command.ends_with("-v MODE=fast job.sh"));
    }

    #[tokio::test]
    async fn test_status_from_qstat() {
        let transport = MockTransport::new();
        transport.on("qstat", MockResponse::ok(QSTAT));
        let scheduler = gridengine(transport);

        let running = scheduler.get_job_status("101").await.unwrap();
        assert!(running.is_running());
        assert_eq!(
            running.scheduler_info().get("queue").map(String::as_str),
            Some("all.q@node1")
        );

        let queued = scheduler.get_job_status("102").await.unwrap();
        assert!(!queued.is_running());
        assert!(!queued.is_done());

        let broken = scheduler.get_job_status("103").await.unwrap();
        assert!(broken.is_done());
        assert!(matches!(
            broken.failure(),
            Some(JobFailure::SchedulerReported { .. })
        ));
    }

    #[tokio::test]
    async fn test_status_from_qacct() {
        let transport = MockTransport::new();
        transport
            .on("qstat", MockResponse::ok(QSTAT))
            .on("qacct", MockResponse::ok(QACCT));
        let scheduler = gridengine(transport);

        let status = scheduler.get_job_status("104").await.unwrap();
        assert!(status.is_done());
        assert_eq!(status.exit_code(), Some(2));
        assert_eq!(status.name(), Some("sleep"));
        assert!(!status.has_exception());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let transport = MockTransport::new();
        transport
            .on("qstat", MockResponse::ok(QSTAT))
            .on("qacct", MockResponse::fail(1, "error: job id 999 not found\n"));
        let scheduler = gridengine(transport);

        let err = scheduler.get_job_status("999").await.unwrap_err();
        assert!(matches!(err, XenonError::NoSuchJob { .. }));
    }

    #[tokio::test]
    async fn test_queues_and_jobs() {
        let transport = MockTransport::new();
        transport
            .on("qconf", MockResponse::ok("all.q\nlong.q\n"))
            .on("qstat", MockResponse::ok(QSTAT));
        let scheduler = gridengine(transport);

        assert_eq!(scheduler.queue_names().await.unwrap(), vec!["all.q", "long.q"]);
        assert_eq!(scheduler.default_queue_name().await.unwrap(), None);
        assert_eq!(
            scheduler.get_jobs(&[]).await.unwrap(),
            vec!["101", "102", "103"]
        );
    }

    #[test]
    fn test_parse_qacct_failed() {
        let raw = parse_qacct(
            "==============================================================\njobname x\nfailed       100 : assumedly after job\nexit_status  137\n",
        )
        .unwrap();
        assert_eq!(raw.state, "FAILED");
        assert_eq!(raw.exit_code, Some(137));
        assert_eq!(GridEngine.classify(&raw), StateClass::Failed);
    }

    #[test]
    fn test_classify() {
        let raw = |state: &str| RawStatus {
            state: state.to_string(),
            ..Default::default()
        };
        assert_eq!(GridEngine.classify(&raw("qw")), StateClass::Pending);
        assert_eq!(GridEngine.classify(&raw("hqw")), StateClass::Pending);
        assert_eq!(GridEngine.classify(&raw("Rq")), StateClass::Pending);
        assert_eq!(GridEngine.classify(&raw("r")), StateClass::Running);
        assert_eq!(GridEngine.classify(&raw("t")), StateClass::Running);
        assert_eq!(GridEngine.classify(&raw("dr")), StateClass::Running);
        assert_eq!(GridEngine.classify(&raw("Eqw")), StateClass::Failed);
        assert_eq!(GridEngine.classify(&raw("DONE")), StateClass::Done);
    }
}
