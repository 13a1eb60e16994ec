//! Adaptor registry and dispatch
//!
//! Adaptors are statically linked. Each family lists its own in a
//! `builtin_adaptors()` function ([`crate::scheduler::builtin_adaptors`],
//! [`crate::filesystem::builtin_adaptors`]) that is handed to an
//! [`AdaptorRegistryBuilder`]. The builder rejects duplicate names and
//! schemes, then freezes into an [`AdaptorRegistry`] that is only ever read;
//! lookups take no locks.
//!
//! ```
//! use xenon::registry::AdaptorRegistry;
//!
//! let registry = AdaptorRegistry::builtin().unwrap();
//! for name in registry.scheduler_adaptor_names() {
//!     let adaptor = registry.scheduler_adaptor(name).unwrap();
//!     assert_eq!(adaptor.descriptor().name, name);
//! }
//! ```

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::XenonConfig;
use crate::credential::Credential;
use crate::error::{Result, XenonError};
use crate::filesystem::{self, FileSystem};
use crate::location::split_uri;
use crate::properties::{Properties, PropertyDescription};
use crate::scheduler::{self, Scheduler};

const FILE_COMPONENT: &str = "file system registry";
const SCHEDULER_COMPONENT: &str = "scheduler registry";

/// Static description of one adaptor
#[derive(Debug)]
pub struct AdaptorDescriptor {
    /// Unique key within its component
    pub name: &'static str,
    pub description: &'static str,
    /// URI schemes that select this adaptor
    pub schemes: &'static [&'static str],
    /// Location formats the adaptor accepts, for display
    pub location_patterns: &'static [&'static str],
    pub properties: &'static [PropertyDescription],
}

/// Factory for scheduler sessions
#[async_trait]
pub trait SchedulerAdaptor: Send + Sync {
    fn descriptor(&self) -> &'static AdaptorDescriptor;

    /// Open a session at `location` with already validated properties
    async fn create_scheduler(
        &self,
        location: &str,
        credential: &Credential,
        properties: Properties,
    ) -> Result<Box<dyn Scheduler>>;
}

/// Factory for file system sessions
#[async_trait]
pub trait FileAdaptor: Send + Sync {
    fn descriptor(&self) -> &'static AdaptorDescriptor;

    async fn create_file_system(
        &self,
        location: &str,
        credential: &Credential,
        properties: Properties,
    ) -> Result<Box<dyn FileSystem>>;
}

struct Entry<A: ?Sized> {
    descriptor: &'static AdaptorDescriptor,
    adaptor: Arc<A>,
}

/// Name and scheme index for one kind of adaptor
struct Component<A: ?Sized> {
    kind: &'static str,
    entries: BTreeMap<String, Entry<A>>,
    schemes: HashMap<String, String>,
}

impl<A: ?Sized> Component<A> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
            schemes: HashMap::new(),
        }
    }

    fn duplicate(&self, name: &str) -> XenonError {
        XenonError::DuplicateAdaptor {
            component: self.kind.to_string(),
            name: name.to_string(),
        }
    }

    fn insert(&mut self, descriptor: &'static AdaptorDescriptor, adaptor: Arc<A>) -> Result<()> {
        let name = descriptor.name.to_ascii_lowercase();
        if name.trim().is_empty() {
            return Err(XenonError::Config(format!(
                "{}: adaptor with a blank name",
                self.kind
            )));
        }
        if self.entries.contains_key(&name) || self.schemes.contains_key(&name) {
            return Err(self.duplicate(&name));
        }

        let mut schemes = Vec::with_capacity(descriptor.schemes.len());
        for scheme in descriptor.schemes {
            let scheme = scheme.to_ascii_lowercase();
            let taken = self.schemes.contains_key(&scheme)
                || (scheme != name && self.entries.contains_key(&scheme))
                || schemes.contains(&scheme);
            if taken {
                return Err(self.duplicate(&scheme));
            }
            schemes.push(scheme);
        }

        for scheme in schemes {
            self.schemes.insert(scheme, name.clone());
        }
        debug!(component = self.kind, adaptor = %name, "adaptor registered");
        self.entries.insert(name, Entry { descriptor, adaptor });
        Ok(())
    }

    /// Resolve a name or a scheme
    fn get(&self, key: &str) -> Result<&Entry<A>> {
        let unknown = || XenonError::UnknownAdaptor {
            component: self.kind.to_string(),
            name: key.to_string(),
        };

        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(unknown());
        }

        self.entries
            .get(&key)
            .or_else(|| {
                self.schemes
                    .get(&key)
                    .and_then(|name| self.entries.get(name))
            })
            .ok_or_else(unknown)
    }

    fn names(&self) -> Vec<&'static str> {
        self.entries.values().map(|e| e.descriptor.name).collect()
    }

    fn descriptors(&self) -> Vec<&'static AdaptorDescriptor> {
        self.entries.values().map(|e| e.descriptor).collect()
    }
}

/// Collects adaptors before freezing them into a registry
pub struct AdaptorRegistryBuilder {
    files: Component<dyn FileAdaptor>,
    schedulers: Component<dyn SchedulerAdaptor>,
    defaults: BTreeMap<String, BTreeMap<String, String>>,
    error: Option<XenonError>,
}

impl AdaptorRegistryBuilder {
    fn new() -> Self {
        Self {
            files: Component::new(FILE_COMPONENT),
            schedulers: Component::new(SCHEDULER_COMPONENT),
            defaults: BTreeMap::new(),
            error: None,
        }
    }

    pub fn scheduler(self, adaptor: impl SchedulerAdaptor + 'static) -> Self {
        self.shared_scheduler(Arc::new(adaptor))
    }

    pub fn file_system(self, adaptor: impl FileAdaptor + 'static) -> Self {
        self.shared_file_system(Arc::new(adaptor))
    }

    pub fn shared_scheduler(mut self, adaptor: Arc<dyn SchedulerAdaptor>) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.schedulers.insert(adaptor.descriptor(), adaptor) {
                self.error = Some(e);
            }
        }
        self
    }

    pub fn shared_file_system(mut self, adaptor: Arc<dyn FileAdaptor>) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.files.insert(adaptor.descriptor(), adaptor) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Per-adaptor property defaults, keyed by adaptor name
    pub fn adaptor_defaults(mut self, defaults: BTreeMap<String, BTreeMap<String, String>>) -> Self {
        self.defaults = defaults;
        self
    }

    /// Freeze the registry
    ///
    /// # Errors
    ///
    /// [`XenonError::DuplicateAdaptor`] if two adaptors share a name or a
    /// scheme, [`XenonError::Config`] if configured defaults name an adaptor
    /// that is not registered.
    pub fn build(self) -> Result<AdaptorRegistry> {
        let Self {
            files,
            schedulers,
            defaults: configured,
            error,
        } = self;
        if let Some(e) = error {
            return Err(e);
        }

        // configuration may use a scheme; defaults are looked up by name
        let mut defaults: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (key, values) in configured {
            let name = schedulers
                .get(&key)
                .map(|e| e.descriptor.name)
                .or_else(|_| files.get(&key).map(|e| e.descriptor.name))
                .map_err(|_| {
                    XenonError::Config(format!(
                        "properties configured for unknown adaptor `{}`",
                        key
                    ))
                })?;
            defaults.entry(name.to_string()).or_default().extend(values);
        }

        info!(
            schedulers = ?schedulers.names(),
            file_systems = ?files.names(),
            "adaptor registry ready"
        );

        Ok(AdaptorRegistry {
            files,
            schedulers,
            defaults,
        })
    }
}

/// Frozen set of file and scheduler adaptors
pub struct AdaptorRegistry {
    files: Component<dyn FileAdaptor>,
    schedulers: Component<dyn SchedulerAdaptor>,
    defaults: BTreeMap<String, BTreeMap<String, String>>,
}

impl fmt::Debug for AdaptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptorRegistry")
            .field("schedulers", &self.schedulers.names())
            .field("file_systems", &self.files.names())
            .finish()
    }
}

impl AdaptorRegistry {
    pub fn builder() -> AdaptorRegistryBuilder {
        AdaptorRegistryBuilder::new()
    }

    /// Builder preloaded with every adaptor compiled into this build
    pub fn with_builtins() -> AdaptorRegistryBuilder {
        let builder = scheduler::builtin_adaptors()
            .into_iter()
            .fold(Self::builder(), AdaptorRegistryBuilder::shared_scheduler);
        filesystem::builtin_adaptors()
            .into_iter()
            .fold(builder, AdaptorRegistryBuilder::shared_file_system)
    }

    /// Built-in adaptors without configured defaults
    pub fn builtin() -> Result<Self> {
        Self::with_builtins().build()
    }

    /// Built-in adaptors with property defaults from `config`
    pub fn from_config(config: &XenonConfig) -> Result<Self> {
        Self::with_builtins()
            .adaptor_defaults(config.adaptors.clone())
            .build()
    }

    /// Look up a scheduler adaptor by name or scheme
    pub fn scheduler_adaptor(&self, name: &str) -> Result<&dyn SchedulerAdaptor> {
        Ok(self.schedulers.get(name)?.adaptor.as_ref())
    }

    /// Look up a file adaptor by name or scheme
    pub fn file_adaptor(&self, name: &str) -> Result<&dyn FileAdaptor> {
        Ok(self.files.get(name)?.adaptor.as_ref())
    }

    /// Registered scheduler adaptor names, sorted
    pub fn scheduler_adaptor_names(&self) -> Vec<&'static str> {
        self.schedulers.names()
    }

    /// Registered file adaptor names, sorted
    pub fn file_adaptor_names(&self) -> Vec<&'static str> {
        self.files.names()
    }

    pub fn scheduler_descriptors(&self) -> Vec<&'static AdaptorDescriptor> {
        self.schedulers.descriptors()
    }

    pub fn file_descriptors(&self) -> Vec<&'static AdaptorDescriptor> {
        self.files.descriptors()
    }

    fn properties(
        &self,
        descriptor: &'static AdaptorDescriptor,
        explicit: BTreeMap<String, String>,
    ) -> Result<Properties> {
        Properties::with_defaults(
            descriptor.name,
            descriptor.properties,
            self.defaults.get(descriptor.name),
            explicit,
        )
    }

    /// Open a scheduler through the adaptor named (or schemed) `adaptor`
    pub async fn create_scheduler(
        &self,
        adaptor: &str,
        location: &str,
        credential: &Credential,
        properties: BTreeMap<String, String>,
    ) -> Result<Box<dyn Scheduler>> {
        let entry = self.schedulers.get(adaptor)?;
        let properties = self.properties(entry.descriptor, properties)?;
        debug!(adaptor = entry.descriptor.name, location, "creating scheduler");
        entry
            .adaptor
            .create_scheduler(location, credential, properties)
            .await
    }

    /// Open a scheduler for `scheme://location`
    pub async fn create_scheduler_from_uri(
        &self,
        uri: &str,
        credential: &Credential,
        properties: BTreeMap<String, String>,
    ) -> Result<Box<dyn Scheduler>> {
        let (scheme, location) = split_uri(uri)?;
        self.create_scheduler(&scheme, &location, credential, properties)
            .await
    }

    /// Open a file system through the adaptor named (or schemed) `adaptor`
    pub async fn create_file_system(
        &self,
        adaptor: &str,
        location: &str,
        credential: &Credential,
        properties: BTreeMap<String, String>,
    ) -> Result<Box<dyn FileSystem>> {
        let entry = self.files.get(adaptor)?;
        let properties = self.properties(entry.descriptor, properties)?;
        debug!(adaptor = entry.descriptor.name, location, "creating file system");
        entry
            .adaptor
            .create_file_system(location, credential, properties)
            .await
    }

    /// Open a file system for `scheme://location`
    pub async fn create_file_system_from_uri(
        &self,
        uri: &str,
        credential: &Credential,
        properties: BTreeMap<String, String>,
    ) -> Result<Box<dyn FileSystem>> {
        let (scheme, location) = split_uri(uri)?;
        self.create_file_system(&scheme, &location, credential, properties)
            .await
    }
}

static GLOBAL: OnceCell<AdaptorRegistry> = OnceCell::new();

/// Process-wide registry, built on first use from the user configuration
pub fn global() -> Result<&'static AdaptorRegistry> {
    GLOBAL.get_or_try_init(|| {
        let config = XenonConfig::load_or_default()?;
        AdaptorRegistry::from_config(&config)
    })
}

/// Install a registry as the process-wide one
///
/// Fails if the global registry was already initialized.
pub fn install(registry: AdaptorRegistry) -> Result<()> {
    GLOBAL
        .set(registry)
        .map_err(|_| XenonError::Config("adaptor registry already initialized".to_string()))
}
