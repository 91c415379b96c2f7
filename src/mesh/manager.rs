//! Endpoint registry and topic-based message routing.
//!
//! The manager exclusively owns every endpoint; other components refer to
//! endpoints by id or identity. Lifecycle changes surface as `Notice` values
//! drained by the daemon core after each event, which keeps the manager free
//! of callbacks into the engines.

use std::collections::{BTreeMap, VecDeque};

use crate::daemon::metrics;

use super::endpoint::{ConnectionState, Endpoint, EndpointId, FrameSink};
use super::frame;
use super::identity::Identity;
use super::proto::{Envelope, Reply, Request, encode_envelope};

/// Lifecycle event queued by the manager, drained by the daemon core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    NewEndpoint(EndpointId),
    SessionEstablished(EndpointId),
    EndpointClosed(EndpointId, Identity),
}

pub struct EndpointManager {
    identity: Identity,
    next_id: EndpointId,
    next_request_id: u64,
    endpoints: BTreeMap<EndpointId, Endpoint>,
    notices: VecDeque<Notice>,
    /// Deliveries addressed to local endpoints, replayed through the normal
    /// inbound dispatch path as `(source, target, envelope)`.
    loopback: VecDeque<(EndpointId, EndpointId, Envelope)>,
}

impl EndpointManager {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            next_id: 1,
            next_request_id: 1,
            endpoints: BTreeMap::new(),
            notices: VecDeque::new(),
            loopback: VecDeque::new(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Register an in-process endpoint. It carries the daemon's own identity
    /// and is session-established from the start.
    pub fn register_local(
        &mut self,
        publications: impl IntoIterator<Item = String>,
        subscriptions: impl IntoIterator<Item = String>,
    ) -> EndpointId {
        let id = self.alloc_id();
        let endpoint = Endpoint::new_local(id, self.identity.clone(), publications, subscriptions);
        self.endpoints.insert(id, endpoint);
        self.notices.push_back(Notice::NewEndpoint(id));
        self.notices.push_back(Notice::SessionEstablished(id));
        id
    }

    /// Register a remote endpoint whose transport handshake has completed.
    pub fn register_remote(&mut self, identity: Identity, sink: Box<dyn FrameSink>) -> EndpointId {
        let id = self.alloc_id();
        let endpoint = Endpoint::new_remote(id, identity, sink);
        self.endpoints.insert(id, endpoint);
        self.notices.push_back(Notice::NewEndpoint(id));
        id
    }

    fn alloc_id(&mut self) -> EndpointId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Remove an endpoint, closing its transport if still open.
    pub fn unregister(&mut self, id: EndpointId) {
        if let Some(mut endpoint) = self.endpoints.remove(&id) {
            if let Some(sink) = endpoint.drop_sink() {
                sink.close();
            }
            endpoint.set_state(ConnectionState::Closed);
            self.notices
                .push_back(Notice::EndpointClosed(id, endpoint.identity().clone()));
        }
    }

    /// Transport failure: mark disconnected and queue the closure notice.
    /// The peer-directory entry is left alone so the reconnect loop can
    /// resurrect the peer.
    pub fn mark_disconnected(&mut self, id: EndpointId) {
        if let Some(endpoint) = self.endpoints.get_mut(&id) {
            if let Some(sink) = endpoint.drop_sink() {
                sink.close();
            }
            endpoint.set_state(ConnectionState::Disconnected);
            self.notices
                .push_back(Notice::EndpointClosed(id, endpoint.identity().clone()));
        }
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<&Endpoint> {
        self.endpoints.get(&id)
    }

    pub fn endpoint_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(&id)
    }

    /// Connected remote endpoint for an identity, if any.
    pub fn lookup(&self, identity: &Identity) -> Option<EndpointId> {
        self.endpoints
            .values()
            .find(|endpoint| {
                !endpoint.is_local() && endpoint.identity() == identity && endpoint.is_connected()
            })
            .map(|endpoint| endpoint.id())
    }

    /// Snapshot of all endpoint ids, for iteration that mutates the registry.
    pub fn ids(&self) -> Vec<EndpointId> {
        self.endpoints.keys().copied().collect()
    }

    pub fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Set both welcome flags checked; fire the session notice exactly once.
    pub fn try_establish_session(&mut self, id: EndpointId) {
        if let Some(endpoint) = self.endpoints.get_mut(&id)
            && endpoint.try_establish_session()
        {
            self.notices.push_back(Notice::SessionEstablished(id));
        }
    }

    /// Count a protocol violation against a peer; returns the running total.
    pub fn note_violation(&mut self, id: EndpointId) -> u32 {
        let Some(endpoint) = self.endpoints.get_mut(&id) else {
            return 0;
        };
        let total = endpoint.note_violation();
        metrics::protocol_violation(endpoint.identity().as_str());
        total
    }

    pub fn poll_notice(&mut self) -> Option<Notice> {
        self.notices.pop_front()
    }

    pub fn poll_loopback(&mut self) -> Option<(EndpointId, EndpointId, Envelope)> {
        self.loopback.pop_front()
    }

    /// Send a request to one endpoint.
    ///
    /// The source must hold a publication for the method and the target a
    /// subscription; a missing subscription drops the message silently (with
    /// a metric), a missing publication is a logged policy violation. Both
    /// are non-fatal.
    pub fn send_unicast(&mut self, source: EndpointId, target: EndpointId, request: Request) {
        let method = request.method.clone();
        if !self.source_may_publish(source, &method) {
            return;
        }
        let Some(target_ref) = self.endpoints.get(&target) else {
            return;
        };
        if !target_ref.has_subscription(&method) {
            metrics::unicast_dropped(&method);
            return;
        }
        self.deliver(source, target, Envelope::request(request));
    }

    /// Deliver a request to every subscribed endpoint except the source.
    pub fn send_multicast(&mut self, source: EndpointId, request: Request) {
        let method = request.method.clone();
        if !self.source_may_publish(source, &method) {
            return;
        }
        let targets: Vec<EndpointId> = self
            .endpoints
            .values()
            .filter(|endpoint| {
                endpoint.id() != source
                    && endpoint.is_connected()
                    && endpoint.has_subscription(&method)
            })
            .map(|endpoint| endpoint.id())
            .collect();

        metrics::multicast_sent(&method, targets.len());
        for target in targets {
            self.deliver(source, target, Envelope::request(request.clone()));
        }
    }

    /// Replies are routed by correlation id and bypass topic policy.
    pub fn send_reply(&mut self, source: EndpointId, target: EndpointId, reply: Reply) {
        self.deliver(source, target, Envelope::reply(reply));
    }

    fn source_may_publish(&mut self, source: EndpointId, method: &str) -> bool {
        match self.endpoints.get(&source) {
            Some(endpoint) if endpoint.has_publication(method) => true,
            Some(endpoint) => {
                tracing::warn!(
                    target: "mesh",
                    source = %endpoint.identity(),
                    method,
                    "attempted to send a topic without publication rights"
                );
                metrics::unicast_dropped(method);
                false
            }
            None => false,
        }
    }

    fn deliver(&mut self, source: EndpointId, target: EndpointId, envelope: Envelope) {
        let Some(endpoint) = self.endpoints.get(&target) else {
            return;
        };
        if endpoint.is_local() {
            self.loopback.push_back((source, target, envelope));
            return;
        }
        if !endpoint.is_connected() {
            return;
        }

        let Some(sink) = endpoint.sink() else {
            return;
        };
        let sent = encode_envelope(&envelope)
            .map_err(|err| tracing::error!(target: "mesh", %err, "envelope encode failed"))
            .ok()
            .and_then(|body| {
                frame::encode_frame(&body)
                    .map_err(|err| tracing::error!(target: "mesh", %err, "frame encode failed"))
                    .ok()
            })
            .map(|bytes| sink.send_frame(&bytes));

        if let Some(Err(err)) = sent {
            tracing::info!(
                target: "mesh",
                peer = %endpoint.identity(),
                %err,
                "send failed; marking endpoint disconnected"
            );
            self.mark_disconnected(target);
        }
    }
}
