//! Local transport: commands run as child processes of this process

use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use xenon_core_interface::{
    CommandLine, InteractiveProcess, ProcessStreams, Result, Transport, TransportError,
};

/// Grace period for reaping a process after it was killed
const REAP_TIMEOUT: Duration = Duration::from_millis(200);

/// Transport that launches processes on this machine
#[derive(Debug, Default)]
pub struct LocalTransport {
    closed: AtomicBool,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a process and return the concrete handle
    pub fn spawn(&self, command: &CommandLine) -> Result<LocalProcess> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut builder = Command::new(&command.executable);
        builder
            .args(&command.arguments)
            .envs(&command.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &command.working_directory {
            builder.current_dir(dir);
        }

        let mut child = builder.spawn().map_err(|source| TransportError::Launch {
            command: command.to_string(),
            source,
        })?;

        let mut streams = ProcessStreams::default();
        if let Some(stdin) = child.stdin.take() {
            streams.stdin = Some(Box::new(stdin));
        }
        if let Some(stdout) = child.stdout.take() {
            streams.stdout = Some(Box::new(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            streams.stderr = Some(Box::new(stderr));
        }

        debug!(pid = ?child.id(), command = %command, "started local process");

        Ok(LocalProcess {
            pid: child.id(),
            child,
            streams,
            exit_code: None,
        })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    fn endpoint(&self) -> String {
        "localhost".to_string()
    }

    async fn execute(&self, command: &CommandLine) -> Result<Box<dyn InteractiveProcess>> {
        Ok(Box::new(self.spawn(command)?))
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// A child process with piped standard streams
#[derive(Debug)]
pub struct LocalProcess {
    child: Child,
    pid: Option<u32>,
    streams: ProcessStreams,
    exit_code: Option<i32>,
}

impl LocalProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send SIGKILL to the process id; false if no signal could be delivered
    #[cfg(unix)]
    fn kill_by_pid(&self) -> bool {
        match self.pid.and_then(|pid| i32::try_from(pid).ok()) {
            // SAFETY: kill(2) has no memory-safety preconditions
            Some(pid) => unsafe { libc::kill(pid, libc::SIGKILL) == 0 },
            None => false,
        }
    }

    #[cfg(not(unix))]
    fn kill_by_pid(&self) -> bool {
        false
    }
}

/// Exit code of a finished process; signals map to 128 + signal number
pub(crate) fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}

#[async_trait]
impl InteractiveProcess for LocalProcess {
    fn streams(&mut self) -> &mut ProcessStreams {
        &mut self.streams
    }

    fn is_done(&mut self) -> bool {
        if self.exit_code.is_some() {
            return true;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(exit_code_of(status));
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(pid = ?self.pid, "cannot poll local process: {}", e);
                self.exit_code = Some(-1);
                true
            }
        }
    }

    fn exit_status(&self) -> Option<i32> {
        self.exit_code
    }

    async fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let status = self.child.wait().await?;
        let code = exit_code_of(status);
        self.exit_code = Some(code);
        Ok(code)
    }

    async fn destroy(&mut self) {
        if self.is_done() {
            return;
        }

        if !self.kill_by_pid() {
            if let Err(e) = self.child.start_kill() {
                warn!(pid = ?self.pid, "failed to kill local process: {}", e);
                return;
            }
        }

        if let Ok(Ok(status)) = tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            self.exit_code = Some(exit_code_of(status));
        }
        debug!(pid = ?self.pid, exit = ?self.exit_code, "destroyed local process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_exit_code_and_output() {
        let transport = LocalTransport::new();
        let mut process = transport
            .execute(&CommandLine::new("sh").arg("-c").arg("echo hello; exit 3"))
            .await
            .unwrap();

        let mut stdout = process.streams().stdout.take().unwrap();
        let mut output = String::new();
        stdout.read_to_string(&mut output).await.unwrap();

        assert_eq!(process.wait().await.unwrap(), 3);
        assert!(process.is_done());
        assert_eq!(process.exit_status(), Some(3));
        assert_eq!(output, "hello\n");
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let transport = LocalTransport::new();
        let mut process = transport.execute(&CommandLine::new("cat")).await.unwrap();
        let mut streams = process.take_streams();

        let mut stdin = streams.stdin.take().unwrap();
        stdin.write_all(b"ping").await.unwrap();
        drop(stdin);

        let mut output = Vec::new();
        streams
            .stdout
            .take()
            .unwrap()
            .read_to_end(&mut output)
            .await
            .unwrap();

        assert_eq!(output, b"ping");
        assert_eq!(process.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_environment_and_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let transport = LocalTransport::new();
        let command = CommandLine::new("sh")
            .arg("-c")
            .arg("echo \"$GREETING\"; pwd")
            .env("GREETING", "hi")
            .current_dir(dir.path().to_string_lossy());

        let mut process = transport.execute(&command).await.unwrap();
        let mut output = String::new();
        process
            .streams()
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut output)
            .await
            .unwrap();
        process.wait().await.unwrap();

        let mut lines = output.lines();
        assert_eq!(lines.next(), Some("hi"));
        let pwd = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(pwd, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let transport = LocalTransport::new();
        let err = transport
            .execute(&CommandLine::new("/nonexistent/xenon-test-binary"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_is_done_does_not_block() {
        let transport = LocalTransport::new();
        let mut process = transport
            .execute(&CommandLine::new("sleep").arg("30"))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        assert!(!process.is_done());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(process.exit_status(), None);

        process.destroy().await;
        assert!(process.is_done());
        process.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_finished_process_is_noop() {
        let transport = LocalTransport::new();
        let mut process = transport.execute(&CommandLine::new("true")).await.unwrap();
        assert_eq!(process.wait().await.unwrap(), 0);

        process.destroy().await;
        assert_eq!(process.exit_status(), Some(0));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_commands() {
        let transport = LocalTransport::new();
        transport.close().await.unwrap();
        let err = transport
            .execute(&CommandLine::new("true"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Closed));
    }
}
