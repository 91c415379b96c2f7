//! Peer discovery: handshake, peer directory, TTL expiry, reconnect loop.
//!
//! The engine is the sole writer of the peer directory. It registers the
//! three discovery topics on a local endpoint and reacts to new endpoints
//! and the periodic discovery timer.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{MeshConfig, PeerEntry};
use crate::daemon::metrics;

use super::endpoint::EndpointId;
use super::identity::{Identity, topics};
use super::manager::EndpointManager;
use super::permissions::RoleTable;
use super::proto::{Params, Request};

/// Reconnect instruction surfaced by the discovery tick; the daemon core
/// hands these to the transport dialer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connect {
    pub address: String,
    pub port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub publications: BTreeSet<String>,
    pub subscriptions: BTreeSet<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub last_seen: u64,
}

pub struct DiscoveryEngine {
    local_endpoint: EndpointId,
    /// Our own advertised reachability, when we listen for peers.
    local_listen: Option<(String, u16)>,
    directory: BTreeMap<Identity, DirectoryEntry>,
    peers: Vec<PeerEntry>,
    roles: RoleTable,
    peer_roles: BTreeMap<Identity, Vec<String>>,
    registration_ttl_ms: u64,
}

impl DiscoveryEngine {
    pub fn new(
        manager: &mut EndpointManager,
        config: &MeshConfig,
        local_listen: Option<(String, u16)>,
    ) -> Self {
        let discovery_topics = [
            topics::DISCOVERY_REGISTER.to_string(),
            topics::DISCOVERY_ANNOUNCE.to_string(),
            topics::DISCOVERY_WELCOME.to_string(),
        ];
        let local_endpoint =
            manager.register_local(discovery_topics.clone(), discovery_topics);

        let peer_roles = config
            .peers
            .iter()
            .map(|peer| (Identity::new(peer.identity.clone()), peer.roles.clone()))
            .collect();

        Self {
            local_endpoint,
            local_listen,
            directory: BTreeMap::new(),
            peers: config.peers.clone(),
            roles: RoleTable::new(config.roles.clone()),
            peer_roles,
            registration_ttl_ms: config.registration_ttl_ms(),
        }
    }

    pub fn local_endpoint(&self) -> EndpointId {
        self.local_endpoint
    }

    pub fn directory_entry(&self, identity: &Identity) -> Option<&DirectoryEntry> {
        self.directory.get(identity)
    }

    pub fn directory_len(&self) -> usize {
        self.directory.len()
    }

    /// Whether inbound `discovery.announce` content from this peer is
    /// trusted, i.e. the peer is configured with a role permitting it to
    /// relay announcements (a broker).
    pub fn is_trusted_broker(&self, identity: &Identity) -> bool {
        self.peer_roles
            .get(identity)
            .is_some_and(|held| self.roles.may_publish(held, topics::DISCOVERY_ANNOUNCE))
    }

    /// New endpoint appeared in the registry.
    pub fn on_new_endpoint(&mut self, manager: &mut EndpointManager, id: EndpointId, now_ms: u64) {
        let Some(endpoint) = manager.endpoint(id) else {
            return;
        };
        if endpoint.is_local() {
            return;
        }
        let identity = endpoint.identity().clone();

        if identity == *manager.identity() {
            tracing::warn!(
                target: "discovery",
                "detected loop-back connection; disconnecting endpoint"
            );
            manager.unregister(id);
            return;
        }

        // Duplicate identity: tear down every older connected endpoint.
        for other in manager.ids() {
            if other == id {
                continue;
            }
            let Some(candidate) = manager.endpoint(other) else {
                continue;
            };
            if !candidate.is_local()
                && candidate.is_connected()
                && candidate.identity() == &identity
            {
                tracing::warn!(
                    target: "discovery",
                    %identity,
                    "detected duplicate identity; disconnecting old endpoint"
                );
                manager.unregister(other);
            }
        }

        // Handshake grants: any peer may send us registrations and welcomes,
        // and always wants ours. Announce relay rights come from broker roles.
        let trusted_broker = self.is_trusted_broker(&identity);
        if let Some(endpoint) = manager.endpoint_mut(id) {
            endpoint.register_publication(topics::DISCOVERY_REGISTER);
            endpoint.register_publication(topics::DISCOVERY_WELCOME);
            if trusted_broker {
                endpoint.register_publication(topics::DISCOVERY_ANNOUNCE);
            }
            endpoint.register_subscription(topics::DISCOVERY_REGISTER);
            endpoint.register_subscription(topics::DISCOVERY_ANNOUNCE);
            endpoint.register_subscription(topics::DISCOVERY_WELCOME);
        }

        // Advertise ourselves, then everything we know about.
        self.send_discovery(manager, topics::DISCOVERY_REGISTER, None, Some(id));
        self.send_discovery(manager, topics::DISCOVERY_ANNOUNCE, None, Some(id));
        let known: Vec<Identity> = self.directory.keys().cloned().collect();
        for subject in known {
            self.send_discovery(manager, topics::DISCOVERY_ANNOUNCE, Some(&subject), Some(id));
        }

        // If a broker already told us about this peer, apply the cached topic
        // sets and complete the handshake; otherwise wait for an announce.
        let cached = self.directory.get(&identity).map(|entry| {
            (
                entry.publications.clone(),
                entry.subscriptions.clone(),
            )
        });
        if let Some((publications, subscriptions)) = cached {
            if let Some(endpoint) = manager.endpoint_mut(id) {
                endpoint.apply_topic_sets(
                    publications.iter().map(String::as_str),
                    subscriptions.iter().map(String::as_str),
                );
            }
            if let Some(entry) = self.directory.get_mut(&identity) {
                entry.last_seen = now_ms;
            }
            self.finish_setup(manager, id);
        }
    }

    /// Complete the welcome handshake if we have not yet greeted this peer.
    fn finish_setup(&mut self, manager: &mut EndpointManager, id: EndpointId) {
        let Some(endpoint) = manager.endpoint(id) else {
            return;
        };
        if endpoint.sent_welcome() {
            return;
        }

        manager.send_unicast(
            self.local_endpoint,
            id,
            Request::new(topics::DISCOVERY_WELCOME),
        );
        if let Some(endpoint) = manager.endpoint_mut(id) {
            endpoint.set_sent_welcome();
        }
        manager.try_establish_session(id);
    }

    /// Inbound `discovery.register`: the subject is the transport identity.
    pub fn handle_register(
        &mut self,
        manager: &mut EndpointManager,
        sender: EndpointId,
        params: &Params,
        now_ms: u64,
    ) {
        let Some(endpoint) = manager.endpoint(sender) else {
            return;
        };
        let identity = endpoint.identity().clone();
        self.process_discovery(manager, &identity, params, false, now_ms);
    }

    /// Inbound `discovery.announce`: the subject is named in the payload.
    /// `trusted` reflects the decoded envelope's source flag (broker peer).
    pub fn handle_announce(
        &mut self,
        manager: &mut EndpointManager,
        _sender: EndpointId,
        params: &Params,
        trusted: bool,
        now_ms: u64,
    ) {
        let Some(identity) = params.get_text("identity") else {
            tracing::debug!(target: "discovery", "announce without identity; dropping");
            return;
        };
        let identity = Identity::from(identity);
        self.process_discovery(manager, &identity, params, trusted, now_ms);
    }

    /// Inbound `discovery.welcome`.
    pub fn handle_welcome(&mut self, manager: &mut EndpointManager, sender: EndpointId) {
        let Some(endpoint) = manager.endpoint_mut(sender) else {
            return;
        };
        if endpoint.received_welcome() {
            return;
        }
        endpoint.set_received_welcome();
        manager.try_establish_session(sender);
    }

    /// Shared body of `register` and `announce` processing.
    fn process_discovery(
        &mut self,
        manager: &mut EndpointManager,
        identity: &Identity,
        params: &Params,
        trusted: bool,
        now_ms: u64,
    ) {
        // Discovery messages about ourselves carry no news.
        if identity == manager.identity() {
            return;
        }

        let held_roles = self.peer_roles.get(identity).cloned().unwrap_or_default();

        let mut publications = BTreeSet::new();
        if let Some(advertised) = params.get_list("publications") {
            for topic in advertised {
                if trusted || self.roles.may_publish(&held_roles, topic) {
                    publications.insert(topic.clone());
                } else {
                    tracing::debug!(
                        target: "discovery",
                        %identity,
                        topic,
                        "publication denied by role policy"
                    );
                }
            }
        }

        let mut subscriptions = BTreeSet::new();
        if let Some(advertised) = params.get_list("subscriptions") {
            for topic in advertised {
                if trusted || self.roles.may_subscribe(&held_roles, topic) {
                    subscriptions.insert(topic.clone());
                } else {
                    tracing::debug!(
                        target: "discovery",
                        %identity,
                        topic,
                        "subscription denied by role policy"
                    );
                }
            }
        }

        // Surviving topics are unioned into the live endpoint, if any.
        let endpoint_id = manager.lookup(identity);
        if let Some(id) = endpoint_id
            && let Some(endpoint) = manager.endpoint_mut(id)
        {
            endpoint.apply_topic_sets(
                publications.iter().map(String::as_str),
                subscriptions.iter().map(String::as_str),
            );
        }

        let address = params.get_text("node").map(str::to_string);
        let port = params
            .get_u64("service")
            .and_then(|value| u16::try_from(value).ok());

        let previous = self.directory.get(identity);
        let changed = previous.is_none_or(|entry| {
            entry.publications != publications || entry.subscriptions != subscriptions
        });

        let entry = self.directory.entry(identity.clone()).or_default();
        entry.publications = publications;
        entry.subscriptions = subscriptions;
        if address.is_some() {
            entry.address = address;
        }
        if port.is_some() {
            entry.port = port;
        }
        entry.last_seen = now_ms;
        metrics::directory_size(self.directory.len());

        // Re-broadcast only when the advertised sets actually changed; the
        // periodic tick covers keep-alive refreshes.
        if changed {
            self.send_discovery(manager, topics::DISCOVERY_ANNOUNCE, Some(identity), None);
        }

        // A direct registration completes the handshake; broker-relayed
        // announcements do not, the peer may not even be connected to us.
        if !trusted && let Some(id) = endpoint_id {
            self.finish_setup(manager, id);
        }
    }

    /// Discovery timer: reconnect configured peers, evict stale directory
    /// entries, keep-alive the rest.
    pub fn tick(&mut self, manager: &mut EndpointManager, now_ms: u64) -> Vec<Connect> {
        let mut connects = Vec::new();

        for peer in &self.peers {
            let identity = Identity::new(peer.identity.clone());
            if manager.lookup(&identity).is_none() {
                connects.push(Connect {
                    address: peer.address.clone(),
                    port: peer.port,
                });
            }
        }

        // A live connection refreshes the entry; silence past the TTL evicts.
        let mut evicted = 0usize;
        let identities: Vec<Identity> = self.directory.keys().cloned().collect();
        for identity in &identities {
            let connected = manager.lookup(identity).is_some();
            let Some(entry) = self.directory.get_mut(identity) else {
                continue;
            };

            if connected {
                entry.last_seen = now_ms;
            } else if entry.last_seen + self.registration_ttl_ms < now_ms {
                self.directory.remove(identity);
                evicted += 1;
                tracing::info!(target: "discovery", %identity, "registration expired; evicting");
                continue;
            }

            self.send_discovery(manager, topics::DISCOVERY_ANNOUNCE, Some(identity), None);

            if !connected {
                let entry = &self.directory[identity];
                if let (Some(address), Some(port)) = (entry.address.clone(), entry.port) {
                    connects.push(Connect { address, port });
                }
            }
        }

        if evicted > 0 {
            metrics::directory_evicted(evicted);
            metrics::directory_size(self.directory.len());
        }

        // Deterministic dial order, deduplicated.
        connects.sort_by(|a, b| (&a.address, a.port).cmp(&(&b.address, b.port)));
        connects.dedup();
        connects
    }

    /// Build and send a `discovery.register` or `discovery.announce` for
    /// `subject` (None = the local daemon). Unicast when `target` is given,
    /// multicast otherwise.
    fn send_discovery(
        &self,
        manager: &mut EndpointManager,
        method: &str,
        subject: Option<&Identity>,
        target: Option<EndpointId>,
    ) {
        let params = match subject {
            None => self.local_params(manager),
            Some(identity) => match self.entry_params(identity) {
                Some(params) => params,
                None => return,
            },
        };

        let request = Request::new(method).with_params(params);
        match target {
            Some(target) => manager.send_unicast(self.local_endpoint, target, request),
            None => manager.send_multicast(self.local_endpoint, request),
        }
    }

    /// Topic sets describing the local daemon: the union over all local
    /// endpoints, which is exactly what the in-process components handle.
    fn local_params(&self, manager: &EndpointManager) -> Params {
        let mut publications = BTreeSet::new();
        let mut subscriptions = BTreeSet::new();
        for id in manager.ids() {
            let Some(endpoint) = manager.endpoint(id) else {
                continue;
            };
            if !endpoint.is_local() {
                continue;
            }
            publications.extend(endpoint.publications().map(str::to_string));
            subscriptions.extend(endpoint.subscriptions().map(str::to_string));
        }

        let mut params = Params::new();
        params
            .set_text("identity", manager.identity().as_str())
            .set_list("publications", publications)
            .set_list("subscriptions", subscriptions);
        if let Some((address, port)) = &self.local_listen {
            params
                .set_text("node", address.clone())
                .set_u64("service", u64::from(*port));
        }
        params
    }

    fn entry_params(&self, identity: &Identity) -> Option<Params> {
        let entry = self.directory.get(identity)?;
        let mut params = Params::new();
        params
            .set_text("identity", identity.as_str())
            .set_list("publications", entry.publications.iter().cloned())
            .set_list("subscriptions", entry.subscriptions.iter().cloned());
        if let Some(address) = &entry.address {
            params.set_text("node", address.clone());
        }
        if let Some(port) = entry.port {
            params.set_u64("service", u64::from(port));
        }
        Some(params)
    }
}
