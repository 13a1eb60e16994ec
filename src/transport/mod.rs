//! Transports: where commands run
//!
//! Adaptors never start processes themselves; they ask a [`Transport`] from
//! `xenon-core-interface`. [`connect`] turns a parsed location into the
//! matching transport.

pub mod local;
#[cfg(test)]
pub mod mock;
#[cfg(feature = "ssh")]
pub mod ssh;

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub use local::{LocalProcess, LocalTransport};
#[cfg(feature = "ssh")]
pub use ssh::{RemoteProcess, SshConfig, SshTransport};
pub use xenon_core_interface::{
    CommandLine, InteractiveProcess, ProcessInput, ProcessOutput, ProcessStreams, Transport,
    TransportError,
};

use crate::credential::Credential;
use crate::error::{Result, XenonError};
use crate::location::TransportLocation;

/// Open the transport a location asks for
pub async fn connect(
    adaptor: &str,
    location: &TransportLocation,
    credential: &Credential,
    timeout: Duration,
) -> Result<Arc<dyn Transport>> {
    match location {
        TransportLocation::Local => {
            debug!(adaptor, "using local transport");
            Ok(Arc::new(LocalTransport::new()))
        }
        #[cfg(feature = "ssh")]
        TransportLocation::Ssh(ssh) => {
            debug!(adaptor, endpoint = %ssh, "connecting ssh transport");
            let config = SshConfig::new(ssh.clone(), credential.clone()).with_timeout(timeout);
            let transport = SshTransport::connect(config)
                .await
                .map_err(|e| XenonError::transport(adaptor, e))?;
            Ok(Arc::new(transport))
        }
        #[cfg(not(feature = "ssh"))]
        TransportLocation::Ssh(ssh) => {
            let _ = (credential, timeout);
            Err(XenonError::Unsupported {
                adaptor: adaptor.to_string(),
                operation: format!("ssh transport to {} (built without the `ssh` feature)", ssh),
            })
        }
    }
}
