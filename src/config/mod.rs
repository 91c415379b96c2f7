//! Daemon configuration schema.
//!
//! Loaded from a single TOML file. All knobs carry the defaults the daemon
//! ships with, so an empty file (plus an `identity`) is a valid configuration.

mod load;

pub use load::{ConfigError, default_config_path, load, load_from_str};

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Globally unique identity of this daemon. Required.
    pub identity: String,
    /// Listen address for inbound peer connections, e.g. "0.0.0.0:5665".
    /// When absent the daemon only dials out.
    pub listen_addr: Option<String>,
    pub logging: LoggingConfig,
    pub mesh: MeshConfig,
    pub export: ExportConfig,
    pub objects: ObjectsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: String::new(),
            listen_addr: None,
            logging: LoggingConfig::default(),
            mesh: MeshConfig::default(),
            export: ExportConfig::default(),
            objects: ObjectsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive, e.g. "info" or "meshmon=debug,info".
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Discovery timer period.
    pub discovery_interval_secs: u64,
    /// Delegation timer period.
    pub delegation_interval_secs: u64,
    /// Maximum silence before a directory entry is evicted.
    pub registration_ttl_secs: u64,
    /// Deadline for a pending service assignment.
    pub assign_timeout_secs: u64,
    /// Deadline for an outbound connection attempt.
    pub connect_timeout_secs: u64,
    /// Protocol violations tolerated per peer before disconnect.
    pub violation_threshold: u32,
    /// Service-name globs this daemon itself is willing to execute.
    pub accepts: Vec<String>,
    /// Statically configured upstream peers.
    pub peers: Vec<PeerEntry>,
    /// Named permission roles referenced by peer entries.
    pub roles: BTreeMap<String, RoleConfig>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            discovery_interval_secs: 30,
            delegation_interval_secs: 30,
            registration_ttl_secs: 300,
            assign_timeout_secs: 30,
            connect_timeout_secs: 10,
            violation_threshold: 5,
            accepts: vec!["*".to_string()],
            peers: Vec::new(),
            roles: BTreeMap::new(),
        }
    }
}

impl MeshConfig {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn delegation_interval(&self) -> Duration {
        Duration::from_secs(self.delegation_interval_secs)
    }

    pub fn registration_ttl_ms(&self) -> u64 {
        self.registration_ttl_secs * 1000
    }

    pub fn assign_timeout_ms(&self) -> u64 {
        self.assign_timeout_secs * 1000
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub identity: String,
    pub address: String,
    pub port: u16,
    /// Service-name globs this peer accepts check assignments for.
    #[serde(default = "default_accepts")]
    pub accepts: Vec<String>,
    /// Roles granting topic permissions to this peer.
    #[serde(default)]
    pub roles: Vec<String>,
}

fn default_accepts() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RoleConfig {
    /// Wildcard patterns for topics a holder may publish.
    pub publications: Vec<String>,
    /// Wildcard patterns for topics a holder may subscribe to.
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub enabled: bool,
    pub socket_address: String,
    pub socket_port: u16,
    pub instance_name: String,
    pub status_interval_secs: u64,
    pub program_status_interval_secs: u64,
    pub config_interval_secs: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket_address: "127.0.0.1".to_string(),
            socket_port: 5668,
            instance_name: "i2-default".to_string(),
            status_interval_secs: 60,
            program_status_interval_secs: 15,
            config_interval_secs: 3600,
        }
    }
}

impl ExportConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn program_status_interval(&self) -> Duration {
        Duration::from_secs(self.program_status_interval_secs)
    }

    pub fn config_interval(&self) -> Duration {
        Duration::from_secs(self.config_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObjectsConfig {
    pub hosts: Vec<HostEntry>,
    pub services: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_check_interval() -> u64 {
    60
}
