//! Scripted in-memory transport for tests
//!
//! Commands are matched by substring against their rendered command line;
//! the first matching rule answers. Responses queued for the same pattern
//! are served in order and the last one repeats.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use xenon_core_interface::{
    CommandLine, InteractiveProcess, ProcessStreams, Result, Transport, TransportError,
};

use crate::forwarder::CaptureBuffer;

#[derive(Debug, Clone)]
pub enum MockResponse {
    Output {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    /// Simulate a broken transport
    Error(std::io::ErrorKind),
    /// A process that never finishes until destroyed
    Hang,
}

impl MockResponse {
    pub fn ok(stdout: &str) -> Self {
        MockResponse::Output {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        MockResponse::Output {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
        }
    }
}

struct Rule {
    pattern: String,
    responses: VecDeque<MockResponse>,
}

#[derive(Debug, Clone)]
pub struct Executed {
    pub command: String,
    pub stdin: CaptureBuffer,
}

#[derive(Default)]
pub struct MockTransport {
    rules: Mutex<Vec<Rule>>,
    executed: Mutex<Vec<Executed>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a response for commands containing `pattern`
    pub fn on(&self, pattern: &str, response: MockResponse) -> &Self {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.responses.push_back(response),
            None => rules.push(Rule {
                pattern: pattern.to_string(),
                responses: VecDeque::from([response]),
            }),
        }
        self
    }

    /// Rendered command lines in execution order
    pub fn commands(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.command.clone())
            .collect()
    }

    /// Number of executed commands containing `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }

    /// Stdin written to the last command containing `pattern`
    pub fn stdin_of(&self, pattern: &str) -> Option<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|e| e.command.contains(pattern))
            .map(|e| e.stdin.to_string_lossy())
    }

    fn respond(&self, command: &str) -> Option<MockResponse> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.iter_mut().find(|r| command.contains(&r.pattern))?;
        if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn endpoint(&self) -> String {
        "mock".to_string()
    }

    async fn execute(&self, command: &CommandLine) -> Result<Box<dyn InteractiveProcess>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let rendered = command.to_string();
        let stdin = CaptureBuffer::new();
        self.executed.lock().unwrap().push(Executed {
            command: rendered.clone(),
            stdin: stdin.clone(),
        });

        let response = self.respond(&rendered).ok_or_else(|| TransportError::Launch {
            command: rendered.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no mock rule"),
        })?;

        let (stdout, stderr, exit_code) = match response {
            MockResponse::Output {
                stdout,
                stderr,
                exit_code,
            } => (stdout, stderr, Some(exit_code)),
            MockResponse::Error(kind) => {
                return Err(TransportError::Io(std::io::Error::new(kind, "mock failure")))
            }
            MockResponse::Hang => (String::new(), String::new(), None),
        };

        Ok(Box::new(MockProcess {
            streams: ProcessStreams::new(
                Box::new(stdin),
                Box::new(Cursor::new(stdout.into_bytes())),
                Box::new(Cursor::new(stderr.into_bytes())),
            ),
            exit_code,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MockProcess {
    streams: ProcessStreams,
    exit_code: Option<i32>,
}

#[async_trait]
impl InteractiveProcess for MockProcess {
    fn streams(&mut self) -> &mut ProcessStreams {
        &mut self.streams
    }

    fn is_done(&mut self) -> bool {
        self.exit_code.is_some()
    }

    fn exit_status(&self) -> Option<i32> {
        self.exit_code
    }

    async fn destroy(&mut self) {
        self.exit_code.get_or_insert(137);
    }
}
