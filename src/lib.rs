/*!
 * Xenon - uniform access to batch schedulers and remote file systems
 *
 * Client code programs against two traits:
 * - [`scheduler::Scheduler`] submits, polls and cancels jobs on a local
 *   shell, a remote shell over SSH, Slurm or Grid Engine
 * - [`filesystem::FileSystem`] reads, writes and lists files on the local
 *   disk or over SFTP
 *
 * The adaptor behind either trait is chosen at runtime by URI scheme through
 * the [`registry`]. Job and copy outcomes travel as snapshots
 * ([`JobStatus`], [`CopyStatus`]) that carry failures as data until the
 * caller asks for them with `maybe_raise`.
 */

pub mod blocking;
pub mod config;
pub mod credential;
pub mod deadline;
pub mod error;
pub mod filesystem;
pub mod forwarder;
pub mod location;
pub mod logging;
pub mod properties;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod status;
pub mod transport;

use std::collections::BTreeMap;

// Re-export commonly used types
pub use config::XenonConfig;
pub use credential::Credential;
pub use deadline::{compute_deadline, Deadline};
pub use error::{Result, XenonError};
pub use filesystem::FileSystem;
pub use location::split_uri;
pub use registry::AdaptorRegistry;
pub use scheduler::{JobDescription, Scheduler};
pub use status::{CopyStatus, JobStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Open a scheduler for `scheme://location` through the global registry
pub async fn create_scheduler(
    uri: &str,
    credential: &Credential,
    properties: BTreeMap<String, String>,
) -> Result<Box<dyn Scheduler>> {
    registry::global()?
        .create_scheduler_from_uri(uri, credential, properties)
        .await
}

/// Open a file system for `scheme://location` through the global registry
pub async fn create_file_system(
    uri: &str,
    credential: &Credential,
    properties: BTreeMap<String, String>,
) -> Result<Box<dyn FileSystem>> {
    registry::global()?
        .create_file_system_from_uri(uri, credential, properties)
        .await
}
