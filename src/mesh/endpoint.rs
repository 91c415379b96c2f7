//! Per-peer endpoint state.
//!
//! An endpoint is the local handle for one peer, remote or local. Remote
//! endpoints carry a frame sink feeding the connection's writer; local
//! endpoints represent in-process components and receive traffic through the
//! manager's loopback queue.

use std::collections::BTreeSet;

use super::identity::Identity;
use super::transport::TransportError;

pub type EndpointId = u64;

/// Outbound half of a peer connection.
pub trait FrameSink: Send {
    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError>;
    /// Ask the connection to shut down. Idempotent.
    fn close(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

pub struct Endpoint {
    id: EndpointId,
    identity: Identity,
    state: ConnectionState,
    local: bool,
    sent_welcome: bool,
    received_welcome: bool,
    session_established: bool,
    publications: BTreeSet<String>,
    subscriptions: BTreeSet<String>,
    violations: u32,
    sink: Option<Box<dyn FrameSink>>,
}

impl Endpoint {
    pub(super) fn new_local(
        id: EndpointId,
        identity: Identity,
        publications: impl IntoIterator<Item = String>,
        subscriptions: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id,
            identity,
            state: ConnectionState::Connected,
            local: true,
            sent_welcome: true,
            received_welcome: true,
            // The local endpoint goes straight to session-established.
            session_established: true,
            publications: publications.into_iter().collect(),
            subscriptions: subscriptions.into_iter().collect(),
            violations: 0,
            sink: None,
        }
    }

    pub(super) fn new_remote(id: EndpointId, identity: Identity, sink: Box<dyn FrameSink>) -> Self {
        Self {
            id,
            identity,
            state: ConnectionState::Connected,
            local: false,
            sent_welcome: false,
            received_welcome: false,
            session_established: false,
            publications: BTreeSet::new(),
            subscriptions: BTreeSet::new(),
            violations: 0,
            sink: Some(sink),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn session_established(&self) -> bool {
        self.session_established
    }

    pub fn sent_welcome(&self) -> bool {
        self.sent_welcome
    }

    pub fn received_welcome(&self) -> bool {
        self.received_welcome
    }

    pub fn set_sent_welcome(&mut self) {
        self.sent_welcome = true;
    }

    pub fn set_received_welcome(&mut self) {
        self.received_welcome = true;
    }

    /// Both welcome flags are set; flip to established. Returns true the
    /// first time only, so the session event fires once per lifetime.
    pub(super) fn try_establish_session(&mut self) -> bool {
        if self.session_established || !self.sent_welcome || !self.received_welcome {
            return false;
        }
        self.session_established = true;
        true
    }

    pub fn register_publication(&mut self, topic: &str) {
        self.publications.insert(topic.to_string());
    }

    pub fn register_subscription(&mut self, topic: &str) {
        self.subscriptions.insert(topic.to_string());
    }

    pub fn has_publication(&self, topic: &str) -> bool {
        self.publications.contains(topic)
    }

    pub fn has_subscription(&self, topic: &str) -> bool {
        self.subscriptions.contains(topic)
    }

    pub fn publications(&self) -> impl Iterator<Item = &str> {
        self.publications.iter().map(String::as_str)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(String::as_str)
    }

    /// Union advertised topic sets into the endpoint's current sets.
    pub fn apply_topic_sets<'a>(
        &mut self,
        publications: impl IntoIterator<Item = &'a str>,
        subscriptions: impl IntoIterator<Item = &'a str>,
    ) {
        for topic in publications {
            self.publications.insert(topic.to_string());
        }
        for topic in subscriptions {
            self.subscriptions.insert(topic.to_string());
        }
    }

    pub(super) fn note_violation(&mut self) -> u32 {
        self.violations += 1;
        self.violations
    }

    pub(super) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub(super) fn sink(&self) -> Option<&dyn FrameSink> {
        self.sink.as_deref()
    }

    pub(super) fn drop_sink(&mut self) -> Option<Box<dyn FrameSink>> {
        self.sink.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    impl FrameSink for NullSink {
        fn send_frame(&self, _frame: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn close(&self) {}
    }

    #[test]
    fn local_endpoint_is_established_at_creation() {
        let endpoint = Endpoint::new_local(1, Identity::from("node-a"), [], []);
        assert!(endpoint.is_local());
        assert!(endpoint.session_established());
        assert!(endpoint.is_connected());
    }

    #[test]
    fn session_requires_both_welcomes_and_fires_once() {
        let mut endpoint = Endpoint::new_remote(2, Identity::from("node-b"), Box::new(NullSink));
        assert!(!endpoint.try_establish_session());

        endpoint.set_sent_welcome();
        assert!(!endpoint.try_establish_session());

        endpoint.set_received_welcome();
        assert!(endpoint.try_establish_session());
        assert!(endpoint.session_established());

        // Second attempt must not fire again.
        assert!(!endpoint.try_establish_session());
    }

    #[test]
    fn topic_sets_union() {
        let mut endpoint = Endpoint::new_remote(3, Identity::from("node-b"), Box::new(NullSink));
        endpoint.register_subscription("discovery.register");
        endpoint.apply_topic_sets(
            ["delegation.assign"],
            ["discovery.register", "delegation.assign"],
        );

        assert!(endpoint.has_publication("delegation.assign"));
        assert!(endpoint.has_subscription("discovery.register"));
        assert!(endpoint.has_subscription("delegation.assign"));
    }
}
