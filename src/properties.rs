//! Typed adaptor properties
//!
//! Each adaptor declares the properties it understands as a static table of
//! [`PropertyDescription`]s. Callers pass plain string maps; [`Properties`]
//! validates them against the table once and then serves typed values,
//! falling back to the declared defaults.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{Result, XenonError};

/// Value type of a property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Boolean,
    Integer,
    /// Non-negative integer
    Natural,
    Long,
    Double,
    String,
    /// Byte size with optional K/M/G suffix (binary units)
    Size,
    /// Duration with ms/s/m/h suffix; a bare number is milliseconds
    Duration,
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyType::Boolean => "boolean",
            PropertyType::Integer => "integer",
            PropertyType::Natural => "natural",
            PropertyType::Long => "long",
            PropertyType::Double => "double",
            PropertyType::String => "string",
            PropertyType::Size => "size",
            PropertyType::Duration => "duration",
        };
        write!(f, "{}", name)
    }
}

/// A property an adaptor accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDescription {
    pub name: &'static str,
    pub property_type: PropertyType,
    pub default: Option<&'static str>,
    pub description: &'static str,
}

impl PropertyDescription {
    pub const fn new(
        name: &'static str,
        property_type: PropertyType,
        default: Option<&'static str>,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            property_type,
            default,
            description,
        }
    }
}

/// Validated property values for one adaptor instance
#[derive(Debug, Clone)]
pub struct Properties {
    adaptor: String,
    descriptions: &'static [PropertyDescription],
    values: BTreeMap<String, String>,
}

impl Properties {
    /// Validate `supplied` against `descriptions`
    ///
    /// # Errors
    ///
    /// [`XenonError::InvalidProperty`] for unknown names or values that do not
    /// parse as the declared type.
    pub fn new(
        adaptor: &str,
        descriptions: &'static [PropertyDescription],
        supplied: BTreeMap<String, String>,
    ) -> Result<Self> {
        for (name, value) in &supplied {
            let description = descriptions
                .iter()
                .find(|d| d.name == name)
                .ok_or_else(|| XenonError::InvalidProperty {
                    adaptor: adaptor.to_string(),
                    name: name.clone(),
                    message: "unknown property".to_string(),
                })?;

            check_value(description.property_type, value).map_err(|message| {
                XenonError::InvalidProperty {
                    adaptor: adaptor.to_string(),
                    name: name.clone(),
                    message,
                }
            })?;
        }

        Ok(Self {
            adaptor: adaptor.to_string(),
            descriptions,
            values: supplied,
        })
    }

    /// Layer explicit values over configured defaults, then validate
    pub fn with_defaults(
        adaptor: &str,
        descriptions: &'static [PropertyDescription],
        configured: Option<&BTreeMap<String, String>>,
        explicit: BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut merged = configured.cloned().unwrap_or_default();
        merged.extend(explicit);
        Self::new(adaptor, descriptions, merged)
    }

    pub fn empty(adaptor: &str, descriptions: &'static [PropertyDescription]) -> Self {
        Self {
            adaptor: adaptor.to_string(),
            descriptions,
            values: BTreeMap::new(),
        }
    }

    /// Whether a value was explicitly supplied
    pub fn is_set(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    fn raw(&self, name: &str, expected: PropertyType) -> Result<Option<&str>> {
        let description = self
            .descriptions
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| self.invalid(name, "property not declared by this adaptor"))?;

        if description.property_type != expected {
            return Err(self.invalid(
                name,
                format!(
                    "declared as {}, requested as {}",
                    description.property_type, expected
                ),
            ));
        }

        Ok(self
            .values
            .get(name)
            .map(String::as_str)
            .or(description.default))
    }

    fn require(&self, name: &str, expected: PropertyType) -> Result<&str> {
        self.raw(name, expected)?
            .ok_or_else(|| self.invalid(name, "no value and no default"))
    }

    fn invalid(&self, name: &str, message: impl Into<String>) -> XenonError {
        XenonError::InvalidProperty {
            adaptor: self.adaptor.clone(),
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub fn get_string(&self, name: &str) -> Result<Option<String>> {
        Ok(self.raw(name, PropertyType::String)?.map(str::to_string))
    }

    pub fn get_bool(&self, name: &str) -> Result<bool> {
        let raw = self.require(name, PropertyType::Boolean)?;
        parse_bool(raw).map_err(|m| self.invalid(name, m))
    }

    pub fn get_integer(&self, name: &str) -> Result<i32> {
        let raw = self.require(name, PropertyType::Integer)?;
        raw.trim().parse().map_err(|e| self.invalid(name, format!("{}", e)))
    }

    pub fn get_natural(&self, name: &str) -> Result<u32> {
        let raw = self.require(name, PropertyType::Natural)?;
        raw.trim().parse().map_err(|e| self.invalid(name, format!("{}", e)))
    }

    pub fn get_long(&self, name: &str) -> Result<i64> {
        let raw = self.require(name, PropertyType::Long)?;
        raw.trim().parse().map_err(|e| self.invalid(name, format!("{}", e)))
    }

    pub fn get_double(&self, name: &str) -> Result<f64> {
        let raw = self.require(name, PropertyType::Double)?;
        raw.trim().parse().map_err(|e| self.invalid(name, format!("{}", e)))
    }

    pub fn get_size(&self, name: &str) -> Result<u64> {
        let raw = self.require(name, PropertyType::Size)?;
        parse_size(raw).map_err(|m| self.invalid(name, m))
    }

    pub fn get_duration(&self, name: &str) -> Result<Duration> {
        let raw = self.require(name, PropertyType::Duration)?;
        parse_duration(raw).map_err(|m| self.invalid(name, m))
    }
}

fn check_value(property_type: PropertyType, raw: &str) -> std::result::Result<(), String> {
    let trimmed = raw.trim();
    match property_type {
        PropertyType::Boolean => parse_bool(trimmed).map(|_| ()),
        PropertyType::Integer => trimmed.parse::<i32>().map(|_| ()).map_err(|e| e.to_string()),
        PropertyType::Natural => trimmed.parse::<u32>().map(|_| ()).map_err(|e| e.to_string()),
        PropertyType::Long => trimmed.parse::<i64>().map(|_| ()).map_err(|e| e.to_string()),
        PropertyType::Double => trimmed.parse::<f64>().map(|_| ()).map_err(|e| e.to_string()),
        PropertyType::String => Ok(()),
        PropertyType::Size => parse_size(trimmed).map(|_| ()),
        PropertyType::Duration => parse_duration(trimmed).map(|_| ()),
    }
}

fn parse_bool(raw: &str) -> std::result::Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        other => Err(format!("`{}` is not a boolean", other)),
    }
}

/// Parse a byte size such as `512`, `64K`, `10MB` or `2g`
pub fn parse_size(raw: &str) -> std::result::Result<u64, String> {
    let upper = raw.trim().to_ascii_uppercase();
    let digits = upper.trim_end_matches('B');
    let (number, multiplier) = match digits.chars().last() {
        Some('K') => (&digits[..digits.len() - 1], 1u64 << 10),
        Some('M') => (&digits[..digits.len() - 1], 1u64 << 20),
        Some('G') => (&digits[..digits.len() - 1], 1u64 << 30),
        Some('T') => (&digits[..digits.len() - 1], 1u64 << 40),
        _ => (digits, 1),
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("`{}` is not a size", raw))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("`{}` is too large", raw))
}

/// Parse a duration such as `250ms`, `1s`, `5m`, `2h` or `1500`
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let (number, unit_millis) = if let Some(n) = trimmed.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = trimmed.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = trimmed.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = trimmed.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (trimmed.as_str(), 1)
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("`{}` is not a duration", raw))?;

    value
        .checked_mul(unit_millis)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("`{}` is too large", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    static DESCRIPTIONS: &[PropertyDescription] = &[
        PropertyDescription::new("poll.delay", PropertyType::Duration, Some("1s"), "delay"),
        PropertyDescription::new("poll.retries", PropertyType::Natural, Some("3"), "retries"),
        PropertyDescription::new("buffer", PropertyType::Size, Some("64K"), "buffer"),
        PropertyDescription::new("strict", PropertyType::Boolean, Some("false"), "strict"),
        PropertyDescription::new("queue", PropertyType::String, None, "queue"),
    ];

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_apply() {
        let props = Properties::new("local", DESCRIPTIONS, BTreeMap::new()).unwrap();
        assert_eq!(props.get_duration("poll.delay").unwrap(), Duration::from_secs(1));
        assert_eq!(props.get_natural("poll.retries").unwrap(), 3);
        assert_eq!(props.get_size("buffer").unwrap(), 64 * 1024);
        assert!(!props.get_bool("strict").unwrap());
        assert_eq!(props.get_string("queue").unwrap(), None);
    }

    #[test]
    fn test_explicit_values_win() {
        let configured = map(&[("poll.delay", "5s"), ("poll.retries", "9")]);
        let props = Properties::with_defaults(
            "slurm",
            DESCRIPTIONS,
            Some(&configured),
            map(&[("poll.delay", "250ms")]),
        )
        .unwrap();

        assert_eq!(
            props.get_duration("poll.delay").unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(props.get_natural("poll.retries").unwrap(), 9);
        assert!(props.is_set("poll.retries"));
        assert!(!props.is_set("strict"));
    }

    #[test]
    fn test_unknown_property_rejected() {
        let err = Properties::new("slurm", DESCRIPTIONS, map(&[("nope", "1")])).unwrap_err();
        match err {
            XenonError::InvalidProperty { adaptor, name, .. } => {
                assert_eq!(adaptor, "slurm");
                assert_eq!(name, "nope");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unparsable_value_rejected() {
        assert!(Properties::new("local", DESCRIPTIONS, map(&[("poll.retries", "-1")])).is_err());
        assert!(Properties::new("local", DESCRIPTIONS, map(&[("strict", "maybe")])).is_err());
        assert!(Properties::new("local", DESCRIPTIONS, map(&[("poll.delay", "soon")])).is_err());
    }

    #[test]
    fn test_wrong_type_request() {
        let props = Properties::empty("local", DESCRIPTIONS);
        assert!(props.get_bool("poll.delay").is_err());
        assert!(props.get_bool("undeclared").is_err());
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("10MB").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("1500").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }
}
