/*!
 * Error types for Xenon
 *
 * Every error that can originate in a backend carries the name of the adaptor
 * that raised it, and its message is prefixed with that name.
 */

use std::io;
use thiserror::Error;
use xenon_core_interface::TransportError;

use crate::status::{CopyFailure, JobFailure};

pub type Result<T> = std::result::Result<T, XenonError>;

/// Exit code used by the command line tool for any unrecovered error
pub const EXIT_FAILURE: i32 = 1;

#[derive(Error, Debug)]
pub enum XenonError {
    /// No adaptor with this name or scheme is registered
    #[error("{component}: unknown adaptor `{name}`")]
    UnknownAdaptor { component: String, name: String },

    /// Two adaptors claim the same name or scheme
    #[error("{component}: adaptor name or scheme `{name}` registered twice")]
    DuplicateAdaptor { component: String, name: String },

    #[error("{adaptor} adaptor: invalid argument: {message}")]
    InvalidArgument { adaptor: String, message: String },

    #[error("{adaptor} adaptor: invalid location `{location}`: {message}")]
    InvalidLocation {
        adaptor: String,
        location: String,
        message: String,
    },

    #[error("{adaptor} adaptor: invalid property `{name}`: {message}")]
    InvalidProperty {
        adaptor: String,
        name: String,
        message: String,
    },

    #[error("{adaptor} adaptor: invalid credential: {message}")]
    InvalidCredential { adaptor: String, message: String },

    #[error("{adaptor} adaptor: invalid job description: {message}")]
    InvalidJobDescription { adaptor: String, message: String },

    #[error("{adaptor} adaptor: connection to {endpoint} failed: {message}")]
    ConnectionFailed {
        adaptor: String,
        endpoint: String,
        message: String,
    },

    #[error("{adaptor} adaptor: authentication failed: {message}")]
    AuthenticationFailed { adaptor: String, message: String },

    /// The executable could not be started at all
    #[error("{adaptor} adaptor: failed to start process `{command}`: {source}")]
    ProcessLaunch {
        adaptor: String,
        command: String,
        #[source]
        source: io::Error,
    },

    /// A helper command ran but reported failure
    #[error("{adaptor} adaptor: command `{command}` failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        adaptor: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{adaptor} adaptor: unexpected output from `{command}`: {output}")]
    UnexpectedOutput {
        adaptor: String,
        command: String,
        output: String,
    },

    #[error("{adaptor} adaptor: no such job `{job_id}`")]
    NoSuchJob { adaptor: String, job_id: String },

    #[error("{adaptor} adaptor: no such copy `{copy_id}`")]
    NoSuchCopy { adaptor: String, copy_id: String },

    #[error("{adaptor} adaptor: path not found: {path}")]
    NotFound { adaptor: String, path: String },

    #[error("{adaptor} adaptor: path already exists: {path}")]
    AlreadyExists { adaptor: String, path: String },

    #[error("{adaptor} adaptor: operation not supported: {operation}")]
    Unsupported { adaptor: String, operation: String },

    /// Operation attempted on a scheduler or file system after `close`
    #[error("{adaptor} adaptor: {resource} is closed")]
    Closed { adaptor: String, resource: String },

    #[error("{adaptor} adaptor: I/O error: {source}")]
    Io {
        adaptor: String,
        #[source]
        source: io::Error,
    },

    #[error("{adaptor} adaptor: {source}")]
    Transport {
        adaptor: String,
        #[source]
        source: TransportError,
    },

    /// Carried job failure raised through `JobStatus::maybe_raise`
    #[error(transparent)]
    Job(#[from] JobFailure),

    /// Carried copy failure raised through `CopyStatus::maybe_raise`
    #[error(transparent)]
    Copy(#[from] CopyFailure),

    #[error("configuration error: {0}")]
    Config(String),
}

impl XenonError {
    /// Attach an adaptor name to a transport error
    ///
    /// Launch failures become [`XenonError::ProcessLaunch`], connection and
    /// authentication failures keep their own variants.
    pub fn transport(adaptor: &str, err: TransportError) -> Self {
        match err {
            TransportError::Launch { command, source } => XenonError::ProcessLaunch {
                adaptor: adaptor.to_string(),
                command,
                source,
            },
            TransportError::Connection { endpoint, message } => XenonError::ConnectionFailed {
                adaptor: adaptor.to_string(),
                endpoint,
                message,
            },
            TransportError::Authentication(message) => XenonError::AuthenticationFailed {
                adaptor: adaptor.to_string(),
                message,
            },
            other => XenonError::Transport {
                adaptor: adaptor.to_string(),
                source: other,
            },
        }
    }

    pub fn io(adaptor: &str, source: io::Error) -> Self {
        XenonError::Io {
            adaptor: adaptor.to_string(),
            source,
        }
    }

    pub fn invalid_argument(adaptor: &str, message: impl Into<String>) -> Self {
        XenonError::InvalidArgument {
            adaptor: adaptor.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_job(adaptor: &str, message: impl Into<String>) -> Self {
        XenonError::InvalidJobDescription {
            adaptor: adaptor.to_string(),
            message: message.into(),
        }
    }

    pub fn closed(adaptor: &str, resource: impl Into<String>) -> Self {
        XenonError::Closed {
            adaptor: adaptor.to_string(),
            resource: resource.into(),
        }
    }

    /// Check if this error is transient and the operation may be retried
    pub fn is_retriable(&self) -> bool {
        match self {
            XenonError::ConnectionFailed { .. } => true,
            XenonError::Transport { source, .. } => source.is_retriable(),
            XenonError::Io { source, .. } => is_io_transient(source),
            _ => false,
        }
    }

    /// Check if this error reports use of a closed resource
    pub fn is_closed(&self) -> bool {
        matches!(self, XenonError::Closed { .. })
            || matches!(
                self,
                XenonError::Transport {
                    source: TransportError::Closed,
                    ..
                }
            )
    }

    /// Name of the adaptor (or registry component) the error is attributed to
    pub fn adaptor(&self) -> Option<&str> {
        match self {
            XenonError::UnknownAdaptor { component, .. }
            | XenonError::DuplicateAdaptor { component, .. } => Some(component),
            XenonError::InvalidArgument { adaptor, .. }
            | XenonError::InvalidLocation { adaptor, .. }
            | XenonError::InvalidProperty { adaptor, .. }
            | XenonError::InvalidCredential { adaptor, .. }
            | XenonError::InvalidJobDescription { adaptor, .. }
            | XenonError::ConnectionFailed { adaptor, .. }
            | XenonError::AuthenticationFailed { adaptor, .. }
            | XenonError::ProcessLaunch { adaptor, .. }
            | XenonError::CommandFailed { adaptor, .. }
            | XenonError::UnexpectedOutput { adaptor, .. }
            | XenonError::NoSuchJob { adaptor, .. }
            | XenonError::NoSuchCopy { adaptor, .. }
            | XenonError::NotFound { adaptor, .. }
            | XenonError::AlreadyExists { adaptor, .. }
            | XenonError::Unsupported { adaptor, .. }
            | XenonError::Closed { adaptor, .. }
            | XenonError::Io { adaptor, .. }
            | XenonError::Transport { adaptor, .. } => Some(adaptor),
            XenonError::Job(failure) => Some(failure.adaptor()),
            XenonError::Copy(failure) => Some(failure.adaptor()),
            XenonError::Config(_) => None,
        }
    }
}

fn is_io_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | BrokenPipe
            | TimedOut
            | Interrupted
            | WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_adaptor_qualified() {
        let err = XenonError::NoSuchJob {
            adaptor: "slurm".to_string(),
            job_id: "42".to_string(),
        };
        assert_eq!(err.to_string(), "slurm adaptor: no such job `42`");
        assert_eq!(err.adaptor(), Some("slurm"));
    }

    #[test]
    fn test_transport_launch_becomes_process_launch() {
        let err = XenonError::transport(
            "local",
            TransportError::Launch {
                command: "does-not-exist".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "No such file"),
            },
        );

        assert!(matches!(err, XenonError::ProcessLaunch { .. }));
        assert!(err.to_string().starts_with("local adaptor: failed to start process"));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_transient_errors() {
        let reset = XenonError::io(
            "ssh",
            io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        );
        assert!(reset.is_retriable());

        let transport = XenonError::transport(
            "slurm",
            TransportError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow")),
        );
        assert!(transport.is_retriable());

        let connect = XenonError::transport(
            "ssh",
            TransportError::Connection {
                endpoint: "host:22".to_string(),
                message: "refused".to_string(),
            },
        );
        assert!(connect.is_retriable());
        assert_eq!(connect.adaptor(), Some("ssh"));
    }

    #[test]
    fn test_permanent_errors() {
        assert!(!XenonError::invalid_job("slurm", "missing executable").is_retriable());
        assert!(!XenonError::closed("local", "scheduler").is_retriable());
        assert!(!XenonError::Config("bad".to_string()).is_retriable());
        assert!(!XenonError::io("file", io::Error::new(io::ErrorKind::NotFound, "gone"))
            .is_retriable());
    }

    #[test]
    fn test_closed_detection() {
        assert!(XenonError::closed("local", "scheduler").is_closed());
        assert!(XenonError::transport("ssh", TransportError::Closed).is_closed());
        assert!(!XenonError::Config("x".to_string()).is_closed());
    }

    #[test]
    fn test_job_failure_keeps_adaptor() {
        let err: XenonError = JobFailure::Cancelled {
            adaptor: "gridengine".to_string(),
            job_id: "7".to_string(),
        }
        .into();
        assert_eq!(err.adaptor(), Some("gridengine"));
        assert!(err.to_string().contains("gridengine adaptor"));
    }
}
