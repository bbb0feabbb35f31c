//! Upstream DTOs
//!
//! Data transfer objects for the registry snapshot endpoint.

use serde::{Deserialize, Serialize};

/// One registered instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamSummary {
    /// Registry key (`name/version`)
    pub key: String,

    /// Address the proxy forwards to (`host:port`)
    pub address: String,

    /// OS process id, when the process reported one
    pub pid: Option<u32>,

    /// Whether this instance currently receives proxied traffic
    pub is_default: bool,
}

/// Snapshot of the whole registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamsSnapshot {
    pub default: Option<String>,
    pub port_range: (u16, u16),
    pub upstreams: Vec<UpstreamSummary>,
}
