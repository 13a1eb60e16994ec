//! Credentials handed to adaptors
//!
//! The engine never looks inside a credential; only transports that need to
//! authenticate (SSH) consume one.

use secrecy::SecretString;
use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Default)]
pub enum Credential {
    /// Use whatever the transport does by default (current user, agent)
    #[default]
    Default,

    /// Username and password
    Password {
        username: String,
        password: SecretString,
    },

    /// Public key authentication with a private key file
    KeyFile {
        username: String,
        key_path: PathBuf,
        passphrase: Option<SecretString>,
    },

    /// Authentication through a running SSH agent
    Agent { username: String },
}

impl Credential {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Password {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn key_file(username: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Credential::KeyFile {
            username: username.into(),
            key_path: key_path.into(),
            passphrase: None,
        }
    }

    /// Set the passphrase of a key file credential, ignored otherwise
    pub fn with_passphrase(mut self, value: impl Into<String>) -> Self {
        if let Credential::KeyFile { passphrase, .. } = &mut self {
            *passphrase = Some(SecretString::from(value.into()));
        }
        self
    }

    pub fn agent(username: impl Into<String>) -> Self {
        Credential::Agent {
            username: username.into(),
        }
    }

    /// Username carried by the credential, if any
    pub fn username(&self) -> Option<&str> {
        match self {
            Credential::Default => None,
            Credential::Password { username, .. }
            | Credential::KeyFile { username, .. }
            | Credential::Agent { username } => Some(username),
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Credential::Default)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Default => write!(f, "Credential::Default"),
            Credential::Password { username, .. } => f
                .debug_struct("Credential::Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Credential::KeyFile {
                username, key_path, ..
            } => f
                .debug_struct("Credential::KeyFile")
                .field("username", username)
                .field("key_path", key_path)
                .finish_non_exhaustive(),
            Credential::Agent { username } => f
                .debug_struct("Credential::Agent")
                .field("username", username)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_username() {
        assert_eq!(Credential::Default.username(), None);
        assert_eq!(Credential::agent("alice").username(), Some("alice"));
        assert_eq!(
            Credential::key_file("bob", "/home/bob/.ssh/id_ed25519").username(),
            Some("bob")
        );
    }

    #[test]
    fn test_debug_hides_secret() {
        let credential = Credential::password("alice", "hunter2");
        let rendered = format!("{:?}", credential);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));

        if let Credential::Password { password, .. } = credential {
            assert_eq!(password.expose_secret(), "hunter2");
        }
    }

    #[test]
    fn test_passphrase_only_applies_to_key_files() {
        let key = Credential::key_file("bob", "/id").with_passphrase("pw");
        assert!(matches!(
            key,
            Credential::KeyFile {
                passphrase: Some(_),
                ..
            }
        ));

        let agent = Credential::agent("bob").with_passphrase("pw");
        assert!(matches!(agent, Credential::Agent { .. }));
    }
}
