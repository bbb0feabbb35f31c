//! Upstream registry
//!
//! In-memory directory of running instances, the port allocator and the
//! single "default" pointer the proxy routes to. Every operation takes the
//! same lock, so port allocation, registration and promotion are
//! linearizable and a reader never observes a default key without its
//! instance.

use hotswap_core::domain::upstream::RegistryKey;
use hotswap_core::dto::upstream::{UpstreamSummary, UpstreamsSnapshot};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::PortRange;
use crate::service::process::ProcessHandle;

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("instance {0} is already registered")]
    DuplicateKey(String),

    #[error("instance {0} is not registered")]
    NotFound(String),

    #[error("no free port in [{min}, {max}]")]
    PortExhausted { min: u16, max: u16 },

    #[error("port {port} is already used by {owner}")]
    PortInUse { port: u16, owner: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A running instance reachable at `address`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub address: String,
    pub port: u16,
    pub process: ProcessHandle,
}

impl Instance {
    pub fn new(host: &str, port: u16, process: ProcessHandle) -> Self {
        Self {
            address: format!("{}:{}", host, port),
            port,
            process,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    instances: BTreeMap<RegistryKey, Instance>,
    default: Option<RegistryKey>,
    /// Ports handed out by `next_port` or bound to a registered instance
    allocated: BTreeSet<u16>,
}

/// Registry of running upstream instances
#[derive(Debug)]
pub struct UpstreamRegistry {
    range: PortRange,
    inner: Mutex<Inner>,
}

impl UpstreamRegistry {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an instance, optionally promoting it in the same step
    pub fn register(
        &self,
        name: &str,
        version: &str,
        instance: Instance,
        make_default: bool,
    ) -> Result<()> {
        let key = RegistryKey::new(name, version);
        let mut inner = self.inner();

        if inner.instances.contains_key(&key) {
            return Err(RegistryError::DuplicateKey(key.to_string()));
        }
        if let Some((owner, _)) = inner
            .instances
            .iter()
            .find(|(_, other)| other.port == instance.port)
        {
            return Err(RegistryError::PortInUse {
                port: instance.port,
                owner: owner.to_string(),
            });
        }

        info!("Registering {} at {}", key, instance.address);
        inner.allocated.insert(instance.port);
        inner.instances.insert(key.clone(), instance);
        if make_default {
            inner.default = Some(key);
        }
        Ok(())
    }

    /// Removes an instance and frees its port
    ///
    /// Does not touch the process: the owner must stop it first. Removing
    /// the default instance clears the default pointer.
    pub fn unregister(&self, name: &str, version: &str) -> Result<()> {
        let key = RegistryKey::new(name, version);
        let mut inner = self.inner();

        let instance = inner
            .instances
            .remove(&key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        inner.allocated.remove(&instance.port);
        if inner.default.as_ref() == Some(&key) {
            inner.default = None;
        }

        info!("Unregistered {} (port {} freed)", key, instance.port);
        Ok(())
    }

    /// Returns the address and process handle of `key`
    pub fn lookup(&self, key: &RegistryKey) -> Result<(String, ProcessHandle)> {
        self.inner()
            .instances
            .get(key)
            .map(|instance| (instance.address.clone(), instance.process))
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    pub fn contains(&self, key: &RegistryKey) -> bool {
        self.inner().instances.contains_key(key)
    }

    pub fn get_default(&self) -> Option<RegistryKey> {
        self.inner().default.clone()
    }

    /// Points the default at an already registered instance
    pub fn set_default(&self, key: &RegistryKey) -> Result<()> {
        let mut inner = self.inner();
        if !inner.instances.contains_key(key) {
            return Err(RegistryError::NotFound(key.to_string()));
        }
        info!("Default upstream is now {}", key);
        inner.default = Some(key.clone());
        Ok(())
    }

    /// Address of the default instance, read under a single lock
    pub fn default_address(&self) -> Option<String> {
        let inner = self.inner();
        inner
            .default
            .as_ref()
            .and_then(|key| inner.instances.get(key))
            .map(|instance| instance.address.clone())
    }

    /// Reserves and returns the lowest free port in the range
    ///
    /// The port stays reserved until it is bound by `register` and later
    /// freed by `unregister`, or handed back with `release_port`.
    pub fn next_port(&self) -> Result<u16> {
        let mut inner = self.inner();
        let port = (self.range.min..=self.range.max)
            .find(|port| !inner.allocated.contains(port))
            .ok_or(RegistryError::PortExhausted {
                min: self.range.min,
                max: self.range.max,
            })?;

        inner.allocated.insert(port);
        debug!("Allocated port {}", port);
        Ok(port)
    }

    /// Returns a reserved port that never got a registered instance
    pub fn release_port(&self, port: u16) {
        if !self.range.contains(port) {
            return;
        }
        let mut inner = self.inner();
        let bound = inner.instances.values().any(|instance| instance.port == port);
        if !bound {
            inner.allocated.remove(&port);
            debug!("Released port {}", port);
        }
    }

    pub fn snapshot(&self) -> UpstreamsSnapshot {
        let inner = self.inner();
        UpstreamsSnapshot {
            default: inner.default.as_ref().map(ToString::to_string),
            port_range: (self.range.min, self.range.max),
            upstreams: inner
                .instances
                .iter()
                .map(|(key, instance)| UpstreamSummary {
                    key: key.to_string(),
                    address: instance.address.clone(),
                    pid: instance.process.pid,
                    is_default: inner.default.as_ref() == Some(key),
                })
                .collect(),
        }
    }
}
