//! Check delegation: exclusive assignment of services to peers.
//!
//! The engine is the only owner of assignment state. Services move through
//! `unassigned -> pending -> assigned`; a pending entry carries a deadline and
//! is skipped by the assignment pass, so two ticks never race on one service.

use std::collections::BTreeMap;

use crate::config::{MeshConfig, ObjectsConfig};
use crate::daemon::metrics;

use super::endpoint::EndpointId;
use super::identity::{Identity, topics};
use super::manager::EndpointManager;
use super::permissions::wildcard_match;
use super::proto::{Params, Reply, ReplyResult, Request};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssignmentState {
    Unassigned,
    Pending {
        assignee: Identity,
        request_id: u64,
        deadline_ms: u64,
    },
    Assigned {
        assignee: Identity,
    },
}

impl AssignmentState {
    pub fn assignee(&self) -> Option<&Identity> {
        match self {
            AssignmentState::Pending { assignee, .. }
            | AssignmentState::Assigned { assignee } => Some(assignee),
            AssignmentState::Unassigned => None,
        }
    }
}

struct ServiceSlot {
    state: AssignmentState,
}

pub struct DelegationEngine {
    local_endpoint: EndpointId,
    local_identity: Identity,
    local_accepts: Vec<String>,
    services: BTreeMap<String, ServiceSlot>,
    peer_accepts: BTreeMap<Identity, Vec<String>>,
    assign_timeout_ms: u64,
    /// Peers excluded per service for exactly one assignment pass, after a
    /// rejection or timeout.
    banned: BTreeMap<String, Identity>,
}

impl DelegationEngine {
    pub fn new(
        manager: &mut EndpointManager,
        mesh: &MeshConfig,
        objects: &ObjectsConfig,
    ) -> Self {
        let local_endpoint = manager.register_local(
            [
                topics::DELEGATION_ASSIGN.to_string(),
                topics::DELEGATION_CLEAR.to_string(),
            ],
            [],
        );

        let services = objects
            .services
            .iter()
            .map(|service| {
                (
                    service.name.clone(),
                    ServiceSlot {
                        state: AssignmentState::Unassigned,
                    },
                )
            })
            .collect();

        let peer_accepts = mesh
            .peers
            .iter()
            .map(|peer| (Identity::new(peer.identity.clone()), peer.accepts.clone()))
            .collect();

        Self {
            local_endpoint,
            local_identity: manager.identity().clone(),
            local_accepts: mesh.accepts.clone(),
            services,
            peer_accepts,
            assign_timeout_ms: mesh.assign_timeout_ms(),
            banned: BTreeMap::new(),
        }
    }

    pub fn assignment(&self, service: &str) -> Option<&AssignmentState> {
        self.services.get(service).map(|slot| &slot.state)
    }

    pub fn assigned_count(&self, identity: &Identity) -> usize {
        self.services
            .values()
            .filter(|slot| slot.state.assignee() == Some(identity))
            .count()
    }

    fn accepts(&self, identity: &Identity, service: &str) -> bool {
        let globs = if identity == &self.local_identity {
            Some(&self.local_accepts)
        } else {
            self.peer_accepts.get(identity)
        };
        match globs {
            // Peers learned purely via discovery take any service.
            None => true,
            Some(globs) => globs.iter().any(|glob| wildcard_match(glob, service)),
        }
    }

    /// Session-established endpoints willing and able to run `service`,
    /// ordered by identity. The local endpoint is always in the running.
    fn candidates(&self, manager: &EndpointManager, service: &str) -> Vec<(Identity, EndpointId)> {
        let mut found: Vec<(Identity, EndpointId)> = manager
            .ids()
            .into_iter()
            .filter_map(|id| manager.endpoint(id))
            .filter(|endpoint| {
                endpoint.is_connected()
                    && endpoint.session_established()
                    && endpoint.has_subscription(topics::DELEGATION_ASSIGN)
            })
            .map(|endpoint| (endpoint.identity().clone(), endpoint.id()))
            .filter(|(identity, _)| self.accepts(identity, service))
            .collect();
        found.sort();
        found
    }

    /// New session with a peer: tell it to drop any assignments it may still
    /// hold from before a reconnect.
    pub fn on_session_established(&mut self, manager: &mut EndpointManager, id: EndpointId) {
        manager.send_unicast(
            self.local_endpoint,
            id,
            Request::new(topics::DELEGATION_CLEAR),
        );
    }

    /// Periodic delegation pass.
    pub fn tick(&mut self, manager: &mut EndpointManager, now_ms: u64) {
        let names: Vec<String> = self.services.keys().cloned().collect();

        // Revalidate current assignments and expire pending ones.
        let mut timed_out = 0usize;
        for name in &names {
            let slot = &self.services[name];
            match &slot.state {
                AssignmentState::Assigned { assignee } => {
                    let still_valid = self
                        .candidates(manager, name)
                        .iter()
                        .any(|(identity, _)| identity == assignee);
                    if !still_valid {
                        tracing::info!(
                            target: "delegation",
                            service = name.as_str(),
                            assignee = %assignee,
                            "assignee no longer a candidate; unassigning"
                        );
                        if let Some(slot) = self.services.get_mut(name) {
                            slot.state = AssignmentState::Unassigned;
                        }
                    }
                }
                AssignmentState::Pending {
                    assignee,
                    deadline_ms,
                    ..
                } => {
                    if *deadline_ms <= now_ms {
                        tracing::info!(
                            target: "delegation",
                            service = name.as_str(),
                            assignee = %assignee,
                            "assignment timed out"
                        );
                        timed_out += 1;
                        self.banned.insert(name.clone(), assignee.clone());
                        if let Some(slot) = self.services.get_mut(name) {
                            slot.state = AssignmentState::Unassigned;
                        }
                    }
                }
                AssignmentState::Unassigned => {}
            }
        }
        if timed_out > 0 {
            metrics::assignments_timed_out(timed_out);
        }

        // Load = services currently bound (assigned or in flight) per peer.
        let mut load: BTreeMap<Identity, usize> = BTreeMap::new();
        for slot in self.services.values() {
            if let Some(assignee) = slot.state.assignee() {
                *load.entry(assignee.clone()).or_default() += 1;
            }
        }

        // Hand out the unassigned services, least-loaded candidate first.
        let mut issued = 0usize;
        for name in &names {
            if self.services[name].state != AssignmentState::Unassigned {
                continue;
            }

            let banned = self.banned.get(name);
            let chosen = self
                .candidates(manager, name)
                .into_iter()
                .filter(|(identity, _)| Some(identity) != banned)
                .min_by_key(|(identity, _)| {
                    (load.get(identity).copied().unwrap_or(0), identity.clone())
                });

            let Some((assignee, endpoint)) = chosen else {
                tracing::debug!(
                    target: "delegation",
                    service = name.as_str(),
                    "no candidate available"
                );
                continue;
            };

            let request_id = manager.next_request_id();
            let mut params = Params::new();
            params.set_text("serviceName", name.clone());
            manager.send_unicast(
                self.local_endpoint,
                endpoint,
                Request::new(topics::DELEGATION_ASSIGN)
                    .with_id(request_id)
                    .with_params(params),
            );

            *load.entry(assignee.clone()).or_default() += 1;
            issued += 1;
            if let Some(slot) = self.services.get_mut(name) {
                slot.state = AssignmentState::Pending {
                    assignee,
                    request_id,
                    deadline_ms: now_ms + self.assign_timeout_ms,
                };
            }
        }
        if issued > 0 {
            metrics::assignments_issued(issued);
        }

        // Bans last for exactly this pass.
        self.banned.clear();
    }

    /// A reply to a `delegation.assign` request arrived.
    pub fn handle_reply(
        &mut self,
        manager: &EndpointManager,
        sender: EndpointId,
        reply: &Reply,
        now_ms: u64,
    ) {
        let Some(sender_identity) = manager.endpoint(sender).map(|e| e.identity().clone()) else {
            return;
        };

        let matched = self.services.iter().find_map(|(name, slot)| match &slot.state {
            AssignmentState::Pending {
                assignee,
                request_id,
                deadline_ms,
            } if *request_id == reply.id => {
                Some((name.clone(), assignee.clone(), *deadline_ms))
            }
            _ => None,
        });

        let Some((name, assignee, deadline_ms)) = matched else {
            metrics::stale_reply();
            return;
        };

        if sender_identity != assignee {
            tracing::debug!(
                target: "delegation",
                service = name.as_str(),
                sender = %sender_identity,
                "reply from a peer that is not the assignee; ignoring"
            );
            metrics::stale_reply();
            return;
        }

        if deadline_ms <= now_ms {
            metrics::stale_reply();
            return;
        }

        let accepted = matches!(
            &reply.result,
            ReplyResult::Ok(params) if params.get_bool("accepted") == Some(true)
        );

        let Some(slot) = self.services.get_mut(&name) else {
            return;
        };
        if accepted {
            tracing::info!(
                target: "delegation",
                service = name.as_str(),
                assignee = %assignee,
                "assignment confirmed"
            );
            slot.state = AssignmentState::Assigned { assignee };
        } else {
            tracing::info!(
                target: "delegation",
                service = name.as_str(),
                assignee = %assignee,
                "assignment rejected"
            );
            slot.state = AssignmentState::Unassigned;
            self.banned.insert(name, assignee);
        }
    }
}
