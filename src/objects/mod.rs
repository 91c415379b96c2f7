//! In-memory monitored object graph.
//!
//! Hosts and services come from configuration. The index is shared with the
//! exporter behind a read/write lock with try-acquire semantics: while a
//! reload holds the write lock, readers get a transient error instead of
//! blocking the event loop.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use thiserror::Error;

use crate::config::ObjectsConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Host {
    pub name: String,
    pub alias: String,
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub host: String,
    pub alias: String,
    pub check_interval_secs: u64,
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct Objects {
    hosts: BTreeMap<String, Host>,
    services: BTreeMap<String, Service>,
}

impl Objects {
    pub fn from_config(config: &ObjectsConfig) -> Self {
        let hosts = config
            .hosts
            .iter()
            .map(|entry| {
                (
                    entry.name.clone(),
                    Host {
                        name: entry.name.clone(),
                        alias: entry.alias.clone().unwrap_or_else(|| entry.name.clone()),
                        groups: entry.groups.clone(),
                    },
                )
            })
            .collect();

        let services = config
            .services
            .iter()
            .map(|entry| {
                (
                    entry.name.clone(),
                    Service {
                        name: entry.name.clone(),
                        host: entry.host.clone(),
                        alias: entry.alias.clone().unwrap_or_else(|| entry.name.clone()),
                        check_interval_secs: entry.check_interval_secs,
                        groups: entry.groups.clone(),
                    },
                )
            })
            .collect();

        Self { hosts, services }
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// Group name to member host names, both sides sorted.
    pub fn host_groups(&self) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for host in self.hosts.values() {
            for group in &host.groups {
                groups.entry(group.clone()).or_default().push(host.name.clone());
            }
        }
        groups
    }

    /// Group name to member (host, service alias) pairs, both sides sorted.
    pub fn service_groups(&self) -> BTreeMap<String, Vec<(String, String)>> {
        let mut groups: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for service in self.services.values() {
            for group in &service.groups {
                groups
                    .entry(group.clone())
                    .or_default()
                    .push((service.host.clone(), service.alias.clone()));
            }
        }
        groups
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("configuration reload in progress")]
    ReloadInProgress,
}

/// Shared handle on the object graph.
#[derive(Clone, Default)]
pub struct ObjectIndex {
    inner: Arc<RwLock<Objects>>,
}

impl ObjectIndex {
    pub fn new(objects: Objects) -> Self {
        Self {
            inner: Arc::new(RwLock::new(objects)),
        }
    }

    /// Non-blocking read snapshot. Fails while a reload is underway.
    pub fn snapshot(&self) -> Result<RwLockReadGuard<'_, Objects>, IndexError> {
        self.inner.try_read().map_err(|_| IndexError::ReloadInProgress)
    }

    /// Swap in a freshly loaded object graph.
    pub fn reload(&self, objects: Objects) {
        match self.inner.write() {
            Ok(mut guard) => *guard = objects,
            Err(poisoned) => *poisoned.into_inner() = objects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostEntry, ServiceEntry};

    fn sample_config() -> ObjectsConfig {
        ObjectsConfig {
            hosts: vec![
                HostEntry {
                    name: "web01".to_string(),
                    alias: Some("Front web".to_string()),
                    groups: vec!["web".to_string()],
                },
                HostEntry {
                    name: "db01".to_string(),
                    alias: None,
                    groups: vec!["db".to_string()],
                },
            ],
            services: vec![
                ServiceEntry {
                    name: "web-http".to_string(),
                    host: "web01".to_string(),
                    alias: None,
                    check_interval_secs: 30,
                    groups: vec!["web".to_string()],
                },
                ServiceEntry {
                    name: "db-query".to_string(),
                    host: "db01".to_string(),
                    alias: Some("query latency".to_string()),
                    check_interval_secs: 120,
                    groups: vec!["db".to_string()],
                },
            ],
        }
    }

    #[test]
    fn aliases_default_to_names() {
        let objects = Objects::from_config(&sample_config());
        assert_eq!(objects.host("db01").unwrap().alias, "db01");
        assert_eq!(objects.host("web01").unwrap().alias, "Front web");
        assert_eq!(objects.service("web-http").unwrap().alias, "web-http");
    }

    #[test]
    fn groups_collect_members() {
        let objects = Objects::from_config(&sample_config());
        let host_groups = objects.host_groups();
        assert_eq!(host_groups["web"], vec!["web01".to_string()]);

        let service_groups = objects.service_groups();
        assert_eq!(
            service_groups["db"],
            vec![("db01".to_string(), "query latency".to_string())]
        );
    }

    #[test]
    fn reload_swaps_the_graph() {
        let index = ObjectIndex::new(Objects::from_config(&sample_config()));
        assert_eq!(index.snapshot().unwrap().hosts().count(), 2);

        index.reload(Objects::default());
        assert_eq!(index.snapshot().unwrap().hosts().count(), 0);
    }
}
