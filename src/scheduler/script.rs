//! Shell rendering shared by the scheduler adaptors

use xenon_core_interface::{shell_quote, CommandLine};

use super::description::{JobDescription, JobTask};
use crate::error::{Result, XenonError};

/// Where unset stdout/stderr go
pub const DISCARD: &str = "/dev/null";

/// `executable arg1 arg2` with every word quoted as needed
pub fn quoted_command(executable: &str, arguments: &[String]) -> String {
    let mut out = shell_quote(executable).into_owned();
    for argument in arguments {
        out.push(' ');
        out.push_str(&shell_quote(argument));
    }
    out
}

/// The shell command that runs the task
pub fn task_shell(task: &JobTask) -> String {
    match task {
        JobTask::Command {
            executable,
            arguments,
        } => quoted_command(executable, arguments),
        JobTask::Script { path } => format!("/bin/sh {}", shell_quote(path)),
    }
}

/// One `export KEY='value'` line per variable
pub fn export_lines(description: &JobDescription) -> String {
    description
        .environment
        .iter()
        .map(|(key, value)| format!("export {}={}\n", key, shell_quote(value)))
        .collect()
}

/// `< in > out 2> err`, discarding unset outputs
pub fn redirections(description: &JobDescription) -> String {
    let mut out = String::new();
    if let Some(stdin) = &description.stdin {
        out.push_str(&format!(" < {}", shell_quote(stdin)));
    }
    out.push_str(&format!(
        " > {}",
        shell_quote(description.stdout.as_deref().unwrap_or(DISCARD))
    ));
    out.push_str(&format!(
        " 2> {}",
        shell_quote(description.stderr.as_deref().unwrap_or(DISCARD))
    ));
    out
}

fn require_task<'a>(adaptor: &str, description: &'a JobDescription) -> Result<&'a JobTask> {
    description
        .task
        .as_ref()
        .ok_or_else(|| XenonError::invalid_job(adaptor, "no executable or script given"))
}

/// Command line that runs the task with its streams attached to the caller
pub fn interactive_command(adaptor: &str, description: &JobDescription) -> Result<CommandLine> {
    let command = match require_task(adaptor, description)? {
        JobTask::Command {
            executable,
            arguments,
        } => CommandLine::new(executable).args(arguments.iter().cloned()),
        JobTask::Script { path } => CommandLine::new("/bin/sh").arg(path.clone()),
    };
    Ok(with_context(command, description))
}

/// Command line that runs the task detached, with file redirections
pub fn batch_command(adaptor: &str, description: &JobDescription) -> Result<CommandLine> {
    let task = require_task(adaptor, description)?;
    let body = format!("exec {}{}", task_shell(task), redirections(description));
    let command = CommandLine::new("/bin/sh").arg("-c").arg(body);
    Ok(with_context(command, description))
}

fn with_context(mut command: CommandLine, description: &JobDescription) -> CommandLine {
    command.environment = description.environment.clone();
    command.working_directory = description.working_directory.clone();
    command
}

/// Render option groups (`["-N", "name"]`) as directive lines
pub fn directive_lines(options: &[Vec<String>]) -> Vec<String> {
    options
        .iter()
        .map(|words| {
            words
                .iter()
                .map(|w| shell_quote(w).into_owned())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

/// A batch script with scheduler directives
///
/// `directives` are rendered one per line behind `prefix` (`#SBATCH`, `#$`).
pub fn render_script(
    adaptor: &str,
    prefix: &str,
    directives: &[String],
    description: &JobDescription,
) -> Result<String> {
    let task = require_task(adaptor, description)?;

    let mut script = String::from("#!/bin/sh\n");
    for directive in directives {
        script.push_str(prefix);
        script.push(' ');
        script.push_str(directive);
        script.push('\n');
    }
    script.push('\n');
    script.push_str(&export_lines(description));
    if let Some(dir) = &description.working_directory {
        script.push_str(&format!("cd {} || exit 1\n", shell_quote(dir)));
    }
    script.push_str(&task_shell(task));
    script.push('\n');
    Ok(script)
}
