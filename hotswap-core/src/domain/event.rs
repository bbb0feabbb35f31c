//! Event domain types
//!
//! Events are the only values that cross the channels between the trigger,
//! deploy and release stages. Each one carries the cycle it belongs to and the
//! environment accumulated so far (version, artifact path, captured outputs).

use serde::{Deserialize, Serialize};

/// Message emitted by the trigger stage
pub const TRIGGERED: &str = "triggered";

/// Message emitted by the deploy stage once the artifact is built
pub const DEPLOYED: &str = "deployed";

/// A single `name=value` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered set of environment variables
///
/// Names are unique. Setting a name that already exists replaces the value
/// in place and keeps the original position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envs(Vec<EnvVar>);

impl Envs {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|var| var.name == name)
            .map(|var| var.value.as_str())
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|var| var.name == name) {
            Some(var) => var.value = value,
            None => self.0.push(EnvVar { name, value }),
        }
    }

    /// Builder form of [`Envs::set`]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EnvVar> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Envs {
    type Item = &'a EnvVar;
    type IntoIter = std::slice::Iter<'a, EnvVar>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Inter-stage message
///
/// `id` identifies the deployment cycle the event belongs to so that the
/// final outcome can be matched with the request that started it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub message: String,
    pub envs: Envs,
}

impl Event {
    pub fn new(id: impl Into<String>, message: impl Into<String>, envs: Envs) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            envs,
        }
    }
}
