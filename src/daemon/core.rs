//! Daemon core: the central coordinator.
//!
//! Every piece of mesh and delegation state is owned here and mutated only
//! from the thread running the event loop. Transport threads, timers and
//! signals feed `Event`s in; the core dispatches inbound envelopes to topic
//! handlers, drains manager notices, and surfaces dial requests for the
//! reconnect loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::export::Exporter;
use crate::mesh::{
    Checker, ConnId, Connect, DelegationEngine, DiscoveryEngine, EndpointId, EndpointManager,
    Envelope, Identity, Notice, Payload, TransportEvent, WireLimits, decode_envelope, topics,
};
use crate::objects::ObjectIndex;

use super::clock::TimeSource;

/// Everything the event loop reacts to.
pub enum Event {
    Transport(TransportEvent),
    DiscoveryTick,
    DelegationTick,
    StatusTick,
    ProgramStatusTick,
    ConfigTick,
}

pub struct Core {
    manager: EndpointManager,
    discovery: DiscoveryEngine,
    delegation: DelegationEngine,
    checker: Checker,
    exporter: Option<Exporter>,
    objects: ObjectIndex,
    clock: Arc<dyn TimeSource>,
    limits: WireLimits,
    violation_threshold: u32,
    conns: BTreeMap<ConnId, EndpointId>,
}

impl Core {
    pub fn new(
        config: &Config,
        objects: ObjectIndex,
        exporter: Option<Exporter>,
        clock: Arc<dyn TimeSource>,
        local_listen: Option<(String, u16)>,
    ) -> Self {
        let mut manager = EndpointManager::new(Identity::new(config.identity.clone()));
        let discovery = DiscoveryEngine::new(&mut manager, &config.mesh, local_listen);
        let delegation = DelegationEngine::new(&mut manager, &config.mesh, &config.objects);
        let checker = Checker::new(&mut manager, config.mesh.accepts.clone());

        let mut core = Self {
            manager,
            discovery,
            delegation,
            checker,
            exporter,
            objects,
            clock,
            limits: WireLimits::default(),
            violation_threshold: config.mesh.violation_threshold,
            conns: BTreeMap::new(),
        };
        // Settle the notices queued while registering local endpoints.
        core.pump();
        core
    }

    pub fn manager(&self) -> &EndpointManager {
        &self.manager
    }

    pub fn discovery(&self) -> &DiscoveryEngine {
        &self.discovery
    }

    pub fn delegation(&self) -> &DelegationEngine {
        &self.delegation
    }

    pub fn checker(&self) -> &Checker {
        &self.checker
    }

    pub fn objects(&self) -> &ObjectIndex {
        &self.objects
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Handle one event to completion. Returned connects are outbound dial
    /// requests for the transport.
    pub fn handle_event(&mut self, event: Event) -> Vec<Connect> {
        let now_ms = self.now_ms();
        let mut connects = Vec::new();
        match event {
            Event::Transport(TransportEvent::Connected {
                conn,
                identity,
                sink,
            }) => {
                let id = self.manager.register_remote(identity, sink);
                self.conns.insert(conn, id);
            }
            Event::Transport(TransportEvent::Frame { conn, body }) => {
                let Some(&id) = self.conns.get(&conn) else {
                    return connects;
                };
                match decode_envelope(&body, &self.limits) {
                    Ok(envelope) => self.dispatch(id, envelope),
                    Err(err) => {
                        tracing::debug!(target: "mesh", %err, "undecodable envelope");
                        self.count_violation(id);
                    }
                }
            }
            Event::Transport(TransportEvent::Disconnected { conn, error }) => {
                if let Some(id) = self.conns.remove(&conn) {
                    if let Some(err) = error {
                        tracing::info!(target: "mesh", %err, "peer connection lost");
                    }
                    self.manager.mark_disconnected(id);
                }
            }
            Event::DiscoveryTick => {
                connects = self.discovery.tick(&mut self.manager, now_ms);
            }
            Event::DelegationTick => {
                self.delegation.tick(&mut self.manager, now_ms);
            }
            Event::StatusTick => self.export_status(),
            Event::ProgramStatusTick => {
                if let Some(exporter) = &self.exporter {
                    exporter.dump_program_status(now_ms);
                }
            }
            Event::ConfigTick => self.export_config(),
        }
        self.pump();
        connects
    }

    /// Shutdown path: farewell on the sink, endpoints closed.
    pub fn shutdown(&mut self) {
        if let Some(exporter) = &self.exporter {
            exporter.send_goodbye(self.now_ms());
        }
        for id in self.manager.ids() {
            let is_remote = self
                .manager
                .endpoint(id)
                .is_some_and(|endpoint| !endpoint.is_local());
            if is_remote {
                self.manager.unregister(id);
            }
        }
        // Closure notices are irrelevant past this point.
        while self.manager.poll_notice().is_some() {}
    }

    fn export_status(&self) {
        let Some(exporter) = &self.exporter else {
            return;
        };
        match self.objects.snapshot() {
            Ok(objects) => exporter.dump_status(&objects, self.now_ms()),
            Err(err) => {
                tracing::info!(target: "export", %err, "skipping status dump");
            }
        }
    }

    fn export_config(&self) {
        let Some(exporter) = &self.exporter else {
            return;
        };
        match self.objects.snapshot() {
            Ok(objects) => exporter.dump_config(&objects, self.now_ms()),
            Err(err) => {
                tracing::info!(target: "export", %err, "skipping config dump");
            }
        }
    }

    /// Route a decoded envelope from `sender` to its topic handler.
    fn dispatch(&mut self, sender: EndpointId, envelope: Envelope) {
        let now_ms = self.now_ms();
        match envelope.payload {
            Payload::Request(request) => match request.method.as_str() {
                topics::DISCOVERY_REGISTER => {
                    self.discovery
                        .handle_register(&mut self.manager, sender, &request.params, now_ms);
                }
                topics::DISCOVERY_ANNOUNCE => {
                    // The trust decision is made here, once, from the decoded
                    // source, not inferred deeper in the engine.
                    let trusted = self
                        .manager
                        .endpoint(sender)
                        .is_some_and(|endpoint| {
                            endpoint.has_publication(topics::DISCOVERY_ANNOUNCE)
                        });
                    self.discovery.handle_announce(
                        &mut self.manager,
                        sender,
                        &request.params,
                        trusted,
                        now_ms,
                    );
                }
                topics::DISCOVERY_WELCOME => {
                    self.discovery.handle_welcome(&mut self.manager, sender);
                }
                topics::DELEGATION_ASSIGN => {
                    if self.sender_may_publish(sender, topics::DELEGATION_ASSIGN) {
                        self.checker
                            .handle_assign(&mut self.manager, sender, &request);
                    }
                }
                topics::DELEGATION_CLEAR => {
                    if self.sender_may_publish(sender, topics::DELEGATION_CLEAR) {
                        self.checker.handle_clear();
                    }
                }
                other => {
                    tracing::debug!(target: "mesh", method = other, "unknown method");
                    self.count_violation(sender);
                }
            },
            Payload::Reply(reply) => {
                self.delegation
                    .handle_reply(&self.manager, sender, &reply, now_ms);
            }
        }
    }

    fn sender_may_publish(&mut self, sender: EndpointId, method: &str) -> bool {
        let permitted = self
            .manager
            .endpoint(sender)
            .is_some_and(|endpoint| endpoint.has_publication(method));
        if !permitted {
            tracing::debug!(
                target: "mesh",
                method,
                "sender lacks publication rights; dropping"
            );
        }
        permitted
    }

    fn count_violation(&mut self, id: EndpointId) {
        let total = self.manager.note_violation(id);
        if total >= self.violation_threshold {
            let identity = self
                .manager
                .endpoint(id)
                .map(|endpoint| endpoint.identity().to_string())
                .unwrap_or_default();
            tracing::warn!(
                target: "mesh",
                identity,
                total,
                "protocol violation threshold reached; disconnecting"
            );
            self.manager.unregister(id);
        }
    }

    /// Drain manager notices and loopback deliveries until quiescent.
    fn pump(&mut self) {
        loop {
            if let Some(notice) = self.manager.poll_notice() {
                self.handle_notice(notice);
                continue;
            }
            if let Some((source, _target, envelope)) = self.manager.poll_loopback() {
                self.dispatch(source, envelope);
                continue;
            }
            break;
        }
    }

    fn handle_notice(&mut self, notice: Notice) {
        let now_ms = self.now_ms();
        match notice {
            Notice::NewEndpoint(id) => {
                self.discovery
                    .on_new_endpoint(&mut self.manager, id, now_ms);
            }
            Notice::SessionEstablished(id) => {
                self.delegation
                    .on_session_established(&mut self.manager, id);
            }
            Notice::EndpointClosed(id, _identity) => {
                self.conns.retain(|_, endpoint| *endpoint != id);
                // A disconnected endpoint has no transport left; drop the
                // registry entry so reconnects start clean.
                let lingering = self
                    .manager
                    .endpoint(id)
                    .is_some_and(|endpoint| !endpoint.is_connected());
                if lingering {
                    self.manager.unregister(id);
                }
            }
        }
    }
}
