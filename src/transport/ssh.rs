//! SSH transport
//!
//! Commands run on exec channels. Every process gets its own session so that
//! a blocked channel never stalls the others; the control session is used for
//! targeted kills and SFTP.

use async_trait::async_trait;
use futures::FutureExt;
use secrecy::ExposeSecret;
use ssh2::{Channel, Session, Sftp};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::{debug, info, warn};
use xenon_core_interface::{
    shell_quote, CommandLine, InteractiveProcess, ProcessStreams, Result, Transport,
    TransportError,
};

use crate::credential::Credential;
use crate::location::SshLocation;

const PIPE_CAPACITY: usize = 64 * 1024;
const PUMP_IDLE: Duration = Duration::from_millis(5);
const KILL_GRACE: Duration = Duration::from_secs(1);

/// SSH connection settings
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub location: SshLocation,
    pub credential: Credential,
    pub timeout: Duration,
}

impl SshConfig {
    pub fn new(location: SshLocation, credential: Credential) -> Self {
        Self {
            location,
            credential,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Username from the credential, the location or the local user
    pub fn username(&self) -> String {
        self.credential
            .username()
            .map(str::to_string)
            .or_else(|| self.location.user.clone())
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string())
    }
}

/// Transport running commands on a remote host over SSH
pub struct SshTransport {
    config: SshConfig,
    control: Arc<Session>,
    closed: AtomicBool,
}

impl SshTransport {
    /// Connect and authenticate the control session
    pub async fn connect(config: SshConfig) -> Result<Self> {
        let blocking_config = config.clone();
        let control = tokio::task::spawn_blocking(move || open_session(&blocking_config))
            .await
            .map_err(|e| TransportError::Other(format!("task join error: {}", e)))??;

        info!(endpoint = %config.location, "ssh session established");

        Ok(Self {
            config,
            control: Arc::new(control),
            closed: AtomicBool::new(false),
        })
    }

    /// Open an SFTP channel on the control session
    pub async fn sftp(&self) -> Result<Sftp> {
        self.ensure_open()?;
        let control = self.control.clone();
        tokio::task::spawn_blocking(move || {
            control
                .sftp()
                .map_err(|e| TransportError::Other(format!("failed to open SFTP channel: {}", e)))
        })
        .await
        .map_err(|e| TransportError::Other(format!("task join error: {}", e)))?
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

fn open_session(config: &SshConfig) -> Result<Session> {
    let addr = config.location.address();
    let connection_failed = |message: String| TransportError::Connection {
        endpoint: addr.clone(),
        message,
    };

    let tcp = TcpStream::connect(&addr).map_err(|e| connection_failed(e.to_string()))?;
    tcp.set_read_timeout(Some(config.timeout)).ok();
    tcp.set_write_timeout(Some(config.timeout)).ok();

    let mut session =
        Session::new().map_err(|e| connection_failed(format!("cannot create session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(config.timeout.as_millis().min(u32::MAX as u128) as u32);
    session
        .handshake()
        .map_err(|e| connection_failed(format!("handshake failed: {}", e)))?;

    let username = config.username();
    match &config.credential {
        Credential::Password { password, .. } => {
            session
                .userauth_password(&username, password.expose_secret())
                .map_err(|e| {
                    TransportError::Authentication(format!("password authentication: {}", e))
                })?;
        }
        Credential::KeyFile {
            key_path,
            passphrase,
            ..
        } => {
            let pass: Option<&str> = passphrase.as_ref().map(|p| p.expose_secret());
            session
                .userauth_pubkey_file(&username, None, key_path, pass)
                .map_err(|e| {
                    TransportError::Authentication(format!("key file authentication: {}", e))
                })?;
        }
        Credential::Agent { .. } | Credential::Default => {
            session.userauth_agent(&username).map_err(|e| {
                TransportError::Authentication(format!("agent authentication: {}", e))
            })?;
        }
    }

    if !session.authenticated() {
        return Err(TransportError::Authentication(format!(
            "{} was not authenticated",
            username
        )));
    }

    Ok(session)
}

/// Run a short command on `session` and collect its output
fn run_blocking(session: &Session, command: &str) -> Result<(String, i32)> {
    let mut channel = session
        .channel_session()
        .map_err(|e| TransportError::Other(format!("cannot open channel: {}", e)))?;
    channel
        .exec(command)
        .map_err(|e| TransportError::Other(format!("exec failed: {}", e)))?;
    let mut output = String::new();
    channel.read_to_string(&mut output)?;
    channel.wait_close().ok();
    let status = channel.exit_status().unwrap_or(-1);
    Ok((output, status))
}

#[async_trait]
impl Transport for SshTransport {
    fn name(&self) -> &str {
        "ssh"
    }

    fn endpoint(&self) -> String {
        self.config.location.to_string()
    }

    async fn execute(&self, command: &CommandLine) -> Result<Box<dyn InteractiveProcess>> {
        self.ensure_open()?;

        let config = self.config.clone();
        let rendered = format!("echo $$ && {}", command.to_shell_string());
        let display = command.to_string();

        let (session, channel) = tokio::task::spawn_blocking(move || -> Result<_> {
            let session = open_session(&config)?;
            let mut channel = session
                .channel_session()
                .map_err(|e| TransportError::Other(format!("cannot open channel: {}", e)))?;
            channel
                .exec(&rendered)
                .map_err(|source| TransportError::Launch {
                    command: rendered.clone(),
                    source: std::io::Error::other(source.to_string()),
                })?;
            Ok((session, channel))
        })
        .await
        .map_err(|e| TransportError::Other(format!("task join error: {}", e)))??;

        debug!(endpoint = %self.config.location, command = %display, "started remote process");

        Ok(Box::new(RemoteProcess::start(
            session,
            channel,
            self.control.clone(),
        )?))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let control = self.control.clone();
        tokio::task::spawn_blocking(move || {
            control.disconnect(None, "closed by client", None).ok();
        })
        .await
        .ok();
        info!(endpoint = %self.config.location, "ssh session closed");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    pid: AtomicU32,
    exit: Mutex<Option<i32>>,
    kill: AtomicBool,
}

impl RemoteState {
    fn exit(&self) -> Option<i32> {
        self.exit.lock().ok().and_then(|guard| *guard)
    }

    fn set_exit(&self, code: i32) {
        if let Ok(mut guard) = self.exit.lock() {
            guard.get_or_insert(code);
        }
    }
}

/// A process running on an SSH exec channel
///
/// A pump thread moves bytes between the non-blocking channel and in-memory
/// pipes that back the [`ProcessStreams`].
pub struct RemoteProcess {
    streams: ProcessStreams,
    state: Arc<RemoteState>,
    control: Arc<Session>,
}

impl RemoteProcess {
    fn start(session: Session, channel: Channel, control: Arc<Session>) -> Result<Self> {
        let (stdin_user, stdin_pump) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_pump, stdout_user) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_pump, stderr_user) = tokio::io::duplex(PIPE_CAPACITY);

        let state = Arc::new(RemoteState::default());
        let pump = Pump {
            session,
            channel,
            stdin: Some(stdin_pump),
            stdout: Some(stdout_pump),
            stderr: Some(stderr_pump),
            state: state.clone(),
            pid_line: Some(Vec::new()),
        };

        std::thread::Builder::new()
            .name("xenon-ssh-pump".to_string())
            .spawn(move || pump.run())?;

        Ok(Self {
            streams: ProcessStreams::new(
                Box::new(stdin_user),
                Box::new(stdout_user),
                Box::new(stderr_user),
            ),
            state,
            control,
        })
    }

    pub fn remote_pid(&self) -> Option<u32> {
        match self.state.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }
}

#[async_trait]
impl InteractiveProcess for RemoteProcess {
    fn streams(&mut self) -> &mut ProcessStreams {
        &mut self.streams
    }

    fn is_done(&mut self) -> bool {
        self.state.exit().is_some()
    }

    fn exit_status(&self) -> Option<i32> {
        self.state.exit()
    }

    async fn destroy(&mut self) {
        if self.is_done() {
            return;
        }

        if let Some(pid) = self.remote_pid() {
            let control = self.control.clone();
            let command = format!("kill -9 {}", shell_quote(&pid.to_string()));
            let killed = tokio::task::spawn_blocking(move || run_blocking(&control, &command))
                .await
                .ok()
                .and_then(|r| r.ok())
                .map(|(_, status)| status == 0)
                .unwrap_or(false);

            if killed {
                let deadline = crate::deadline::Deadline::after(KILL_GRACE);
                while !self.is_done() && !deadline.has_passed() {
                    tokio::time::sleep(PUMP_IDLE).await;
                }
            }
        }

        if !self.is_done() {
            warn!("remote kill failed, closing channel");
            self.state.kill.store(true, Ordering::Release);
        }
    }
}

struct Pump {
    session: Session,
    channel: Channel,
    stdin: Option<DuplexStream>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    state: Arc<RemoteState>,
    /// Buffer for the `echo $$` line until it is complete
    pid_line: Option<Vec<u8>>,
}

impl Pump {
    fn run(mut self) {
        self.session.set_blocking(false);
        let mut buf = vec![0u8; 16 * 1024];

        loop {
            if self.state.kill.load(Ordering::Acquire) {
                self.channel.close().ok();
                self.state.set_exit(128 + 9);
                break;
            }

            let mut progressed = self.pump_stdin(&mut buf);
            let (stdout_progress, stdout_eof) = self.pump_output(false, &mut buf);
            let (stderr_progress, stderr_eof) = self.pump_output(true, &mut buf);
            progressed |= stdout_progress || stderr_progress;

            if stdout_eof && stderr_eof && self.channel.eof() {
                self.finish();
                break;
            }

            if !progressed {
                std::thread::sleep(PUMP_IDLE);
            }
        }

        self.stdout.take();
        self.stderr.take();
    }

    fn finish(&mut self) {
        loop {
            match self.channel.wait_close() {
                Ok(()) => break,
                Err(e) if e.code() == ssh2::ErrorCode::Session(-37) => {
                    std::thread::sleep(PUMP_IDLE)
                }
                Err(e) => {
                    warn!("error closing remote channel: {}", e);
                    break;
                }
            }
        }
        let code = self.channel.exit_status().unwrap_or(-1);
        self.state.set_exit(code);
    }

    fn pump_stdin(&mut self, buf: &mut [u8]) -> bool {
        let Some(stdin) = self.stdin.as_mut() else {
            return false;
        };

        match stdin.read(buf).now_or_never() {
            None => false,
            Some(Ok(0)) | Some(Err(_)) => {
                self.stdin = None;
                self.send_eof();
                true
            }
            Some(Ok(n)) => {
                let mut written = 0;
                while written < n {
                    match self.channel.write(&buf[written..n]) {
                        Ok(w) => written += w,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {
                            std::thread::sleep(PUMP_IDLE)
                        }
                        Err(e) => {
                            debug!("remote stdin closed: {}", e);
                            self.stdin = None;
                            break;
                        }
                    }
                }
                true
            }
        }
    }

    fn send_eof(&mut self) {
        loop {
            match self.channel.send_eof() {
                Ok(()) => return,
                Err(e) if e.code() == ssh2::ErrorCode::Session(-37) => {
                    std::thread::sleep(PUMP_IDLE)
                }
                Err(e) => {
                    debug!("cannot send eof to remote process: {}", e);
                    return;
                }
            }
        }
    }

    /// Move available bytes of one output stream; returns (progressed, eof)
    fn pump_output(&mut self, stderr: bool, buf: &mut [u8]) -> (bool, bool) {
        let read = if stderr {
            self.channel.stderr().read(buf)
        } else {
            self.channel.read(buf)
        };

        match read {
            Ok(0) => (false, self.channel.eof()),
            Ok(n) => {
                if stderr {
                    forward(&mut self.stderr, &buf[..n]);
                } else {
                    let data = self.strip_pid_line(&buf[..n]);
                    forward(&mut self.stdout, &data);
                }
                (true, false)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => (false, false),
            Err(e) => {
                debug!("remote output stream closed: {}", e);
                (false, true)
            }
        }
    }

    fn strip_pid_line(&mut self, data: &[u8]) -> Vec<u8> {
        let Some(line) = self.pid_line.as_mut() else {
            return data.to_vec();
        };

        match data.iter().position(|b| *b == b'\n') {
            Some(end) => {
                line.extend_from_slice(&data[..end]);
                if let Ok(pid) = String::from_utf8_lossy(line).trim().parse::<u32>() {
                    self.state.pid.store(pid, Ordering::Release);
                }
                self.pid_line = None;
                data[end + 1..].to_vec()
            }
            None => {
                line.extend_from_slice(data);
                Vec::new()
            }
        }
    }
}

/// Write to a consumer pipe, dropping it once the consumer has gone away
fn forward(target: &mut Option<DuplexStream>, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    if let Some(pipe) = target.as_mut() {
        if futures::executor::block_on(pipe.write_all(data)).is_err() {
            *target = None;
        }
    }
}
