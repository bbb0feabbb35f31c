//! Upstream domain types

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Version label given to every instance the pipeline promotes
pub const DEFAULT_VERSION: &str = "v1";

/// Identifier of a running instance: `name/version`
///
/// The name may itself contain slashes; the version is whatever follows the
/// last one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegistryKey {
    pub name: String,
    pub version: String,
}

impl RegistryKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Error returned when a string is not a `name/version` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidKey(pub String);

impl std::fmt::Display for InvalidKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid registry key '{}': expected name/version", self.0)
    }
}

impl std::error::Error for InvalidKey {}

impl FromStr for RegistryKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('/') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                Ok(RegistryKey::new(name, version))
            }
            _ => Err(InvalidKey(s.to_string())),
        }
    }
}

impl TryFrom<String> for RegistryKey {
    type Error = InvalidKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RegistryKey> for String {
    fn from(key: RegistryKey) -> Self {
        key.to_string()
    }
}
