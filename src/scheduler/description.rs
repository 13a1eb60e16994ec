//! Job descriptions
//!
//! What to run is a [`JobTask`]: either a command (executable plus
//! arguments) or an existing script handed to the scheduler as is. Everything
//! else describes how and where to run it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, XenonError};

/// The unit of work a job runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobTask {
    Command {
        executable: String,
        #[serde(default)]
        arguments: Vec<String>,
    },
    /// A script that already exists on the scheduler's side
    Script { path: String },
}

/// Everything needed to submit a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDescription {
    pub task: Option<JobTask>,
    pub name: Option<String>,
    pub queue_name: Option<String>,
    pub node_count: u32,
    pub processes_per_node: u32,
    pub cores_per_task: u32,
    pub max_runtime_minutes: Option<u32>,
    pub environment: BTreeMap<String, String>,
    pub working_directory: Option<String>,
    /// File to read stdin from (none if unset)
    pub stdin: Option<String>,
    /// File to write stdout to (discarded if unset)
    pub stdout: Option<String>,
    /// File to write stderr to (discarded if unset)
    pub stderr: Option<String>,
    /// Extra arguments for the submission command, passed through verbatim
    pub scheduler_arguments: Vec<String>,
    /// Adaptor-specific tuning
    pub job_options: BTreeMap<String, String>,
}

impl Default for JobDescription {
    fn default() -> Self {
        Self {
            task: None,
            name: None,
            queue_name: None,
            node_count: 1,
            processes_per_node: 1,
            cores_per_task: 1,
            max_runtime_minutes: None,
            environment: BTreeMap::new(),
            working_directory: None,
            stdin: None,
            stdout: None,
            stderr: None,
            scheduler_arguments: Vec::new(),
            job_options: BTreeMap::new(),
        }
    }
}

impl JobDescription {
    pub fn command<I, S>(executable: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            task: Some(JobTask::Command {
                executable: executable.into(),
                arguments: arguments.into_iter().map(Into::into).collect(),
            }),
            ..Default::default()
        }
    }

    pub fn script(path: impl Into<String>) -> Self {
        Self {
            task: Some(JobTask::Script { path: path.into() }),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue_name = Some(queue.into());
        self
    }

    pub fn with_working_directory(mut self, directory: impl Into<String>) -> Self {
        self.working_directory = Some(directory.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_stdin(mut self, path: impl Into<String>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn with_stdout(mut self, path: impl Into<String>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn with_stderr(mut self, path: impl Into<String>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    pub fn with_max_runtime(mut self, minutes: u32) -> Self {
        self.max_runtime_minutes = Some(minutes);
        self
    }

    pub fn with_job_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.job_options.insert(key.into(), value.into());
        self
    }

    /// Parse a description from TOML
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| XenonError::Config(format!("invalid job description: {}", e)))
    }

    /// Checks shared by every adaptor
    pub fn validate(&self, adaptor: &str) -> Result<()> {
        match &self.task {
            None => return Err(XenonError::invalid_job(adaptor, "no executable or script given")),
            Some(JobTask::Command { executable, .. }) if executable.trim().is_empty() => {
                return Err(XenonError::invalid_job(adaptor, "executable is empty"))
            }
            Some(JobTask::Script { path }) if path.trim().is_empty() => {
                return Err(XenonError::invalid_job(adaptor, "script path is empty"))
            }
            Some(_) => {}
        }

        if self.node_count == 0 {
            return Err(XenonError::invalid_job(adaptor, "node count must be at least 1"));
        }
        if self.processes_per_node == 0 {
            return Err(XenonError::invalid_job(
                adaptor,
                "processes per node must be at least 1",
            ));
        }
        if self.cores_per_task == 0 {
            return Err(XenonError::invalid_job(adaptor, "cores per task must be at least 1"));
        }
        if self.max_runtime_minutes == Some(0) {
            return Err(XenonError::invalid_job(adaptor, "max runtime must be positive"));
        }

        for key in self.environment.keys() {
            if !is_valid_env_name(key) {
                return Err(XenonError::invalid_job(
                    adaptor,
                    format!("invalid environment variable name `{}`", key),
                ));
            }
        }

        Ok(())
    }

    /// Reject job options this adaptor does not know
    pub fn check_job_options(&self, adaptor: &str, known: &[&str]) -> Result<()> {
        match self.job_options.keys().find(|k| !known.contains(&k.as_str())) {
            Some(unknown) => Err(XenonError::invalid_job(
                adaptor,
                format!("unsupported job option `{}`", unknown),
            )),
            None => Ok(()),
        }
    }

    /// Total number of processes requested
    pub fn total_processes(&self) -> u64 {
        u64::from(self.node_count) * u64::from(self.processes_per_node)
    }
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
