//! One-shot command execution with captured output
//!
//! Scripting adaptors talk to their scheduler exclusively through
//! [`RemoteCommandRunner`]: feed a command some input, wait for it, inspect
//! what it printed.

use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};
use xenon_core_interface::{CommandLine, Transport};

use crate::error::{Result, XenonError};
use crate::forwarder::{CaptureBuffer, StreamForwarder};

/// How long output pumps may take to drain after the process exited
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of running one command to completion
#[derive(Debug, Clone)]
pub struct RemoteCommandRunner {
    adaptor: String,
    command: String,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl RemoteCommandRunner {
    /// Run `executable arguments` with `stdin` as its input
    ///
    /// # Errors
    ///
    /// Fails only when the command cannot be started or its exit status
    /// cannot be obtained. A command that runs and fails is reported through
    /// [`success`](Self::success).
    pub async fn run(
        transport: &dyn Transport,
        adaptor: &str,
        stdin: Option<&str>,
        executable: &str,
        arguments: &[&str],
    ) -> Result<Self> {
        let command = CommandLine::new(executable).args(arguments.iter().copied());
        Self::run_command(transport, adaptor, stdin, &command, DEFAULT_DRAIN_TIMEOUT).await
    }

    pub async fn run_command(
        transport: &dyn Transport,
        adaptor: &str,
        stdin: Option<&str>,
        command: &CommandLine,
        drain_timeout: Duration,
    ) -> Result<Self> {
        let rendered = command.to_string();
        debug!(adaptor, command = %rendered, "running command");

        let mut process = transport
            .execute(command)
            .await
            .map_err(|e| XenonError::transport(adaptor, e))?;
        let streams = process.take_streams();

        let stdout = CaptureBuffer::new();
        let stderr = CaptureBuffer::new();
        let stdout_pump = streams
            .stdout
            .map(|out| StreamForwarder::new("stdout", out, Some(stdout.clone())));
        let stderr_pump = streams
            .stderr
            .map(|err| StreamForwarder::new("stderr", err, Some(stderr.clone())));

        if let Some(mut input) = streams.stdin {
            if let Some(text) = stdin {
                if let Err(e) = input.write_all(text.as_bytes()).await {
                    // The command may exit without reading its input
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        process.destroy().await;
                        return Err(XenonError::io(adaptor, e));
                    }
                }
            }
            input.shutdown().await.ok();
        }

        let exit_code = process
            .wait()
            .await
            .map_err(|e| XenonError::transport(adaptor, e))?;

        for pump in [stdout_pump, stderr_pump].into_iter().flatten() {
            pump.terminate(drain_timeout).await;
        }

        let result = Self {
            adaptor: adaptor.to_string(),
            command: rendered,
            exit_code,
            stdout: stdout.to_string_lossy(),
            stderr: stderr.to_string_lossy(),
        };
        trace!(adaptor, command = %result.command, exit_code, stdout = %result.stdout, stderr = %result.stderr, "command finished");

        Ok(result)
    }

    /// Exit code zero and nothing on stderr
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.stderr.is_empty()
    }

    /// Exit code zero, stderr ignored
    pub fn success_ignoring_stderr(&self) -> bool {
        self.exit_code == 0
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Describe an unsuccessful run as an adaptor error
    pub fn failure(&self) -> XenonError {
        XenonError::CommandFailed {
            adaptor: self.adaptor.clone(),
            command: self.command.clone(),
            exit_code: self.exit_code,
            stderr: self.stderr.trim().to_string(),
        }
    }

    /// Turn an unsuccessful run into an error
    pub fn require_success(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(self.failure())
        }
    }
}
