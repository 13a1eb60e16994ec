/*!
 * Configuration types for Xenon
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, XenonError};

/// Engine configuration, usually loaded from `~/.config/xenon/config.toml`
///
/// ```toml
/// log_level = "debug"
///
/// [adaptors.slurm]
/// "poll.delay" = "5s"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XenonConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stderr)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,

    /// Default adaptor properties, keyed by adaptor name
    ///
    /// Properties passed explicitly when creating a scheduler or file
    /// system take precedence over these.
    #[serde(default)]
    pub adaptors: BTreeMap<String, BTreeMap<String, String>>,
}

/// Logging level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    #[default]
    Warn,

    /// Info, warnings, and errors
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl XenonConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            XenonError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
            .map_err(|e| XenonError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| XenonError::Config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| {
            XenonError::Config(format!("cannot write {}: {}", path.display(), e))
        })
    }

    /// Default location of the user configuration file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("xenon").join("config.toml"))
    }

    /// Load the user configuration if it exists, defaults otherwise
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Configured default properties for one adaptor
    pub fn adaptor_properties(&self, adaptor: &str) -> Option<&BTreeMap<String, String>> {
        self.adaptors.get(adaptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_config() {
        let config = XenonConfig::from_toml(
            r#"
            log_level = "debug"
            verbose = true

            [adaptors.slurm]
            "poll.delay" = "5s"
            "poll.retries" = "5"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(config.verbose);
        let slurm = config.adaptor_properties("slurm").unwrap();
        assert_eq!(slurm.get("poll.delay").map(String::as_str), Some("5s"));
        assert!(config.adaptor_properties("gridengine").is_none());
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = XenonConfig::from_toml("").unwrap();
        assert_eq!(config, XenonConfig::default());
        assert_eq!(config.log_level, LogLevel::Warn);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = XenonConfig {
            log_level: LogLevel::Trace,
            ..Default::default()
        };
        config.adaptors.insert(
            "local".to_string(),
            BTreeMap::from([("poll.delay".to_string(), "10ms".to_string())]),
        );

        config.save(&path).unwrap();
        assert_eq!(XenonConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = XenonConfig::load(Path::new("/nonexistent/xenon.toml")).unwrap_err();
        assert!(matches!(err, XenonError::Config(_)));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
