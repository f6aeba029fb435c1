//! On-disk shape of the connections list (§4.6), serialized with `serde`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    Server,
    Client,
}

/// A single connection's front-end/back-end wiring, as persisted and as
/// advertised by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionDescriptor {
    pub tracker: String,
    pub path: String,
    pub role: ConnectionRole,
    pub encrypted: bool,
    pub fixed: bool,
    pub connect_address: String,
    pub connect_port: u16,
    pub listen_address: String,
    pub listen_port: u16,
    #[serde(default)]
    pub peers: Vec<String>,
    /// Canonical peer name once resolved by the tracker, distinct from the
    /// identity-level `peers` allow-list.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Per-tracker active/imported connection maps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConnections {
    #[serde(default)]
    pub active: HashMap<String, ConnectionDescriptor>,
    #[serde(default)]
    pub imported: HashMap<String, ConnectionDescriptor>,
}

/// Top-level persisted file: one `TrackerConnections` per tracker name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionsFile {
    pub schema_version: u32,
    #[serde(default)]
    pub trackers: HashMap<String, TrackerConnections>,
}

impl ConnectionsFile {
    pub fn new() -> Self {
        Self {
            schema_version: 1,
            trackers: HashMap::new(),
        }
    }
}
