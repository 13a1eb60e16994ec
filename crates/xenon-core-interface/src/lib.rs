//! Xenon Core Interface: command transport contract
//!
//! This crate defines the narrow contract the Xenon engine needs from anything
//! that can run a command: a [`Transport`] launches a [`CommandLine`] and hands
//! back an [`InteractiveProcess`] exposing the process's stdin/stdout/stderr
//! and its exit status.
//!
//! # Architecture
//!
//! Two families of implementations exist in the main crate:
//!
//! 1. **Local**: processes started on this machine (`tokio::process`)
//! 2. **Remote**: processes started over a tunnelled session (SSH exec channels)
//!
//! Scheduler and file system adaptors only ever talk to this contract, so a
//! scripting adaptor such as Slurm runs unchanged on either transport.
//!
//! # Example
//!
//! ```rust,no_run
//! use xenon_core_interface::{CommandLine, Transport};
//!
//! async fn hostname<T: Transport>(transport: &T) -> xenon_core_interface::Result<i32> {
//!     let mut process = transport.execute(&CommandLine::new("hostname")).await?;
//!     process.wait().await
//! }
//! ```

use async_trait::async_trait;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Interval used by the default [`InteractiveProcess::wait`] implementation
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to start process `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {endpoint} failed: {message}")]
    Connection { endpoint: String, message: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport is closed")]
    Closed,

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Check if this error is transient and the operation may be retried
    pub fn is_retriable(&self) -> bool {
        match self {
            TransportError::Connection { .. } => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            TransportError::Launch { .. }
            | TransportError::Authentication(_)
            | TransportError::Closed
            | TransportError::Other(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Writable end of a process's standard input
pub type ProcessInput = Box<dyn AsyncWrite + Send + Unpin>;

/// Readable end of a process's standard output or standard error
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// The three standard streams of a running process
///
/// Each stream is independently closable: dropping `stdin` sends end-of-file
/// to the process, dropping `stdout`/`stderr` discards the remaining output.
#[derive(Default)]
pub struct ProcessStreams {
    pub stdin: Option<ProcessInput>,
    pub stdout: Option<ProcessOutput>,
    pub stderr: Option<ProcessOutput>,
}

impl ProcessStreams {
    pub fn new(stdin: ProcessInput, stdout: ProcessOutput, stderr: ProcessOutput) -> Self {
        Self {
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr: Some(stderr),
        }
    }
}

impl fmt::Debug for ProcessStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessStreams")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// A command to run on a transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    pub executable: String,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_directory: Option<String>,
}

impl CommandLine {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    pub fn args<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(arguments.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, directory: impl Into<String>) -> Self {
        self.working_directory = Some(directory.into());
        self
    }

    /// Render as a single POSIX shell command
    ///
    /// Used by transports that can only hand a string to a remote shell, and
    /// for log output. Every word is quoted when needed.
    pub fn to_shell_string(&self) -> String {
        let mut out = String::new();

        if let Some(dir) = &self.working_directory {
            out.push_str("cd ");
            out.push_str(&shell_quote(dir));
            out.push_str(" && ");
        }

        for (key, value) in &self.environment {
            out.push_str("export ");
            out.push_str(key);
            out.push('=');
            out.push_str(&shell_quote(value));
            out.push_str(" && ");
        }

        out.push_str("exec ");
        out.push_str(&shell_quote(&self.executable));
        for argument in &self.arguments {
            out.push(' ');
            out.push_str(&shell_quote(argument));
        }

        out
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.executable))?;
        for argument in &self.arguments {
            write!(f, " {}", shell_quote(argument))?;
        }
        Ok(())
    }
}

/// Quote a word for a POSIX shell, leaving plain words untouched
pub fn shell_quote(word: &str) -> Cow<'_, str> {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));

    if plain {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', "'\\''")))
    }
}

/// A live process with attached standard streams
///
/// # Contract
///
/// - [`is_done`](Self::is_done) never blocks; once it has returned `true` the
///   exit status is cached and [`exit_status`](Self::exit_status) is `Some`.
/// - [`destroy`](Self::destroy) is best effort and idempotent: calling it on a
///   finished process is a no-op.
#[async_trait]
pub trait InteractiveProcess: Send {
    /// Access the process's streams (stdin writable, stdout/stderr readable)
    fn streams(&mut self) -> &mut ProcessStreams;

    /// Detach all streams from the process, leaving `None` behind
    fn take_streams(&mut self) -> ProcessStreams {
        std::mem::take(self.streams())
    }

    /// Non-blocking poll for termination
    fn is_done(&mut self) -> bool;

    /// Exit status, available once [`is_done`](Self::is_done) returned `true`
    fn exit_status(&self) -> Option<i32>;

    /// Wait for the process to terminate and return its exit status
    async fn wait(&mut self) -> Result<i32> {
        loop {
            if self.is_done() {
                return Ok(self.exit_status().unwrap_or(-1));
            }
            tokio::time::sleep(DEFAULT_WAIT_INTERVAL).await;
        }
    }

    /// Forcefully terminate the process
    async fn destroy(&mut self);
}

/// Something that can launch commands, locally or on a remote machine
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short transport name ("local", "ssh")
    fn name(&self) -> &str;

    /// Human-readable endpoint this transport is connected to
    fn endpoint(&self) -> String;

    /// Launch a command and return the running process
    ///
    /// Fails with [`TransportError::Launch`] when the executable cannot be
    /// started and with [`TransportError::Closed`] after [`close`](Self::close).
    async fn execute(&self, command: &CommandLine) -> Result<Box<dyn InteractiveProcess>>;

    /// Whether commands run on this machine
    fn is_local(&self) -> bool {
        false
    }

    /// Release the underlying session
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
