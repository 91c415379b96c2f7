//! Configuration loading and validation.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::Config;

pub const CONFIG_ENV: &str = "MESHMON_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub fn default_config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("meshmon.toml"))
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate(&config)?;
    Ok(config)
}

pub fn load_from_str(contents: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: PathBuf::from("<inline>"),
        source,
    })?;
    validate(&config)?;
    Ok(config)
}

/// Startup-fatal checks. Everything else is tolerated and handled at runtime.
fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.identity.is_empty() {
        return Err(ConfigError::Invalid("identity must be set".to_string()));
    }

    let mut seen = BTreeSet::new();
    for peer in &config.mesh.peers {
        if peer.identity.is_empty() {
            return Err(ConfigError::Invalid(
                "peer entry with empty identity".to_string(),
            ));
        }
        if peer.address.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "peer {} has an empty address",
                peer.identity
            )));
        }
        if !seen.insert(&peer.identity) {
            return Err(ConfigError::Invalid(format!(
                "duplicate peer entry for identity {}",
                peer.identity
            )));
        }
        for role in &peer.roles {
            if !config.mesh.roles.contains_key(role) {
                return Err(ConfigError::Invalid(format!(
                    "peer {} references undefined role {role}",
                    peer.identity
                )));
            }
        }
    }

    let hosts: BTreeSet<&str> = config
        .objects
        .hosts
        .iter()
        .map(|host| host.name.as_str())
        .collect();
    let mut service_names = BTreeSet::new();
    for service in &config.objects.services {
        if !hosts.contains(service.host.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "service {} references unknown host {}",
                service.name, service.host
            )));
        }
        if !service_names.insert(service.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate service name {}",
                service.name
            )));
        }
    }

    Ok(())
}
