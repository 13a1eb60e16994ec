//! Location strings
//!
//! A URI such as `slurm://alice@cluster:2222` is split into a scheme, which
//! selects the adaptor, and a location, which tells the adaptor where to run.
//! Scripting and process schedulers interpret the location as a transport:
//! an empty location (or `local://`) runs commands on this machine, anything
//! else is an SSH endpoint.

use url::Url;

use crate::error::{Result, XenonError};

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Split `scheme://location` into its two halves
///
/// ```
/// let (scheme, location) = xenon::split_uri("slurm://alice@cluster").unwrap();
/// assert_eq!(scheme, "slurm");
/// assert_eq!(location, "alice@cluster");
/// ```
pub fn split_uri(uri: &str) -> Result<(String, String)> {
    let trimmed = uri.trim();
    let (scheme, location) = trimmed
        .split_once("://")
        .ok_or_else(|| XenonError::InvalidLocation {
            adaptor: "registry".to_string(),
            location: uri.to_string(),
            message: "expected scheme://location".to_string(),
        })?;

    let valid_scheme = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.');
    if !valid_scheme {
        return Err(XenonError::InvalidLocation {
            adaptor: "registry".to_string(),
            location: uri.to_string(),
            message: format!("invalid scheme `{}`", scheme),
        });
    }

    Ok((scheme.to_ascii_lowercase(), location.to_string()))
}

/// Remote endpoint reached over SSH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshLocation {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
}

impl SshLocation {
    /// `host:port` form used for TCP connections
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for SshLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if self.port != DEFAULT_SSH_PORT {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

/// Where a process-based adaptor runs its commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportLocation {
    Local,
    Ssh(SshLocation),
}

impl TransportLocation {
    /// Parse a location on behalf of `adaptor`
    pub fn parse(adaptor: &str, location: &str) -> Result<Self> {
        let trimmed = location.trim();
        if trimmed.is_empty() || trimmed == "local://" || trimmed == "local" || trimmed == "/" {
            return Ok(TransportLocation::Local);
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("ssh://{}", trimmed)
        };

        let invalid = |message: String| XenonError::InvalidLocation {
            adaptor: adaptor.to_string(),
            location: location.to_string(),
            message,
        };

        let url = Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;

        if url.scheme() != "ssh" {
            return Err(invalid(format!(
                "unsupported transport scheme `{}`",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;

        if !(url.path().is_empty() || url.path() == "/") {
            return Err(invalid(format!("unexpected path `{}`", url.path())));
        }

        let user = match url.username() {
            "" => None,
            name => Some(name.to_string()),
        };

        Ok(TransportLocation::Ssh(SshLocation {
            user,
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_SSH_PORT),
        }))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, TransportLocation::Local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_uri() {
        assert_eq!(
            split_uri("slurm://cluster").unwrap(),
            ("slurm".to_string(), "cluster".to_string())
        );
        assert_eq!(
            split_uri("LOCAL://").unwrap(),
            ("local".to_string(), String::new())
        );
        assert_eq!(
            split_uri("file:///tmp/data").unwrap(),
            ("file".to_string(), "/tmp/data".to_string())
        );
        assert!(split_uri("cluster").is_err());
        assert!(split_uri("://cluster").is_err());
    }

    #[test]
    fn test_local_locations() {
        for location in ["", "  ", "local://", "local", "/"] {
            assert_eq!(
                TransportLocation::parse("slurm", location).unwrap(),
                TransportLocation::Local
            );
        }
    }

    #[test]
    fn test_ssh_locations() {
        let parsed = TransportLocation::parse("slurm", "alice@cluster:2222").unwrap();
        assert_eq!(
            parsed,
            TransportLocation::Ssh(SshLocation {
                user: Some("alice".to_string()),
                host: "cluster".to_string(),
                port: 2222,
            })
        );

        let parsed = TransportLocation::parse("ssh", "ssh://login.example.org").unwrap();
        match parsed {
            TransportLocation::Ssh(ssh) => {
                assert_eq!(ssh.user, None);
                assert_eq!(ssh.port, DEFAULT_SSH_PORT);
                assert_eq!(ssh.address(), "login.example.org:22");
                assert_eq!(ssh.to_string(), "login.example.org");
            }
            TransportLocation::Local => panic!("expected ssh location"),
        }
    }

    #[test]
    fn test_invalid_locations() {
        let err = TransportLocation::parse("gridengine", "http://host").unwrap_err();
        assert_eq!(err.adaptor(), Some("gridengine"));
        assert!(matches!(err, XenonError::InvalidLocation { .. }));

        assert!(TransportLocation::parse("slurm", "host:notaport").is_err());
        assert!(TransportLocation::parse("slurm", "host/some/path").is_err());
    }
}
