//! Discovery scenarios: loopback, duplicates, broker-mediated discovery,
//! announce suppression, TTL expiry.

mod common;

use common::{TestNet, announce_message, establish, register_message, welcome_message};
use meshmon::mesh::{Connect, topics};

const NODE_A: &str = r#"
identity = "A"

[mesh]
registration_ttl_secs = 300

[mesh.roles.peer]
publications = ["discovery.*", "delegation.*"]
subscriptions = ["discovery.*", "delegation.*"]

[[mesh.peers]]
identity = "B"
address = "10.0.0.2"
port = 5665
roles = ["peer"]

[[mesh.peers]]
identity = "broker"
address = "10.0.0.9"
port = 5665
roles = ["peer"]
"#;

#[test]
fn loopback_connection_is_suppressed() {
    let mut net = TestNet::new(NODE_A);
    let peer = net.connect("A");

    assert!(peer.sink.is_closed());
    assert!(net.core.manager().lookup(&"A".into()).is_none());
    assert!(net.core.discovery().directory_entry(&"A".into()).is_none());
}

#[test]
fn duplicate_identity_keeps_the_newer_endpoint() {
    let mut net = TestNet::new(NODE_A);
    let first = net.connect("B");
    assert!(!first.sink.is_closed());

    let second = net.connect("B");

    assert!(first.sink.is_closed());
    assert!(!second.sink.is_closed());
    let surviving = net.core.manager().lookup(&"B".into()).unwrap();
    assert_eq!(
        net.core.manager().endpoint(surviving).unwrap().identity(),
        &"B".into()
    );
}

#[test]
fn new_endpoint_receives_register_and_announcements() {
    let mut net = TestNet::new(NODE_A);
    let peer = net.connect("B");

    let registers = peer.sink.requests(topics::DISCOVERY_REGISTER);
    assert_eq!(registers.len(), 1);
    assert_eq!(registers[0].params.get_text("identity"), Some("A"));
    let advertised = registers[0].params.get_list("subscriptions").unwrap();
    assert!(advertised.iter().any(|topic| topic == topics::DELEGATION_ASSIGN));

    let announces = peer.sink.requests(topics::DISCOVERY_ANNOUNCE);
    assert_eq!(announces.len(), 1);
    assert_eq!(announces[0].params.get_text("identity"), Some("A"));
}

#[test]
fn welcome_handshake_establishes_session_once() {
    let mut net = TestNet::new(NODE_A);
    let peer = net.connect("B");

    // B registers directly: its advertised topics pass the role filter and
    // the daemon completes its half of the handshake.
    net.receive(&peer, &register_message());
    assert_eq!(peer.sink.requests(topics::DISCOVERY_WELCOME).len(), 1);

    let id = net.core.manager().lookup(&"B".into()).unwrap();
    assert!(!net.core.manager().endpoint(id).unwrap().session_established());

    net.receive(&peer, &welcome_message());
    let endpoint = net.core.manager().endpoint(id).unwrap();
    assert!(endpoint.session_established());

    // A redundant welcome must not restart anything.
    net.receive(&peer, &welcome_message());
    assert_eq!(peer.sink.requests(topics::DISCOVERY_WELCOME).len(), 1);
}

#[test]
fn session_establishment_sends_delegation_clear() {
    let mut net = TestNet::new(NODE_A);
    let peer = net.connect("B");
    establish(&mut net, &peer);

    // Stale state on the reconnecting peer is discarded.
    assert_eq!(peer.sink.requests(topics::DELEGATION_CLEAR).len(), 1);
}

#[test]
fn broker_announce_creates_directory_entry_and_reconnect() {
    let mut net = TestNet::new(NODE_A);
    let broker = net.connect("broker");
    establish(&mut net, &broker);
    broker.sink.clear();

    net.receive(&broker, &announce_message("C", Some(("10.0.0.3", 5665))));

    let entry = net.core.discovery().directory_entry(&"C".into()).unwrap();
    assert_eq!(entry.address.as_deref(), Some("10.0.0.3"));
    assert_eq!(entry.port, Some(5665));
    // The broker's relayed topics are trusted without role filtering.
    assert!(entry.subscriptions.contains(topics::DELEGATION_ASSIGN));

    // The news is flooded to connected peers.
    let relayed = broker.sink.requests(topics::DISCOVERY_ANNOUNCE);
    assert!(
        relayed
            .iter()
            .any(|request| request.params.get_text("identity") == Some("C"))
    );

    // Next tick dials the announced address.
    let connects = net.discovery_tick();
    assert!(connects.contains(&Connect {
        address: "10.0.0.3".to_string(),
        port: 5665,
    }));
}

#[test]
fn unchanged_announce_refreshes_last_seen_without_rebroadcast() {
    let mut net = TestNet::new(NODE_A);
    let broker = net.connect("broker");
    establish(&mut net, &broker);

    net.receive(&broker, &announce_message("C", Some(("10.0.0.3", 5665))));
    let first_seen = net
        .core
        .discovery()
        .directory_entry(&"C".into())
        .unwrap()
        .last_seen;
    let announces_after_first = broker.sink.requests(topics::DISCOVERY_ANNOUNCE).len();

    net.clock.advance_ms(5_000);
    net.receive(&broker, &announce_message("C", Some(("10.0.0.3", 5665))));

    let entry = net.core.discovery().directory_entry(&"C".into()).unwrap();
    assert!(entry.last_seen > first_seen);
    // Topic sets did not change, so the announcement is not re-flooded.
    assert_eq!(
        broker.sink.requests(topics::DISCOVERY_ANNOUNCE).len(),
        announces_after_first
    );
}

#[test]
fn directory_entry_expires_after_registration_ttl() {
    let mut net = TestNet::new(NODE_A);
    let broker = net.connect("broker");
    establish(&mut net, &broker);

    net.receive(&broker, &announce_message("D", Some(("10.0.0.4", 5665))));
    assert!(net.core.discovery().directory_entry(&"D".into()).is_some());

    // One millisecond past the TTL: gone.
    net.clock.advance_ms(300_000 + 1);
    let connects = net.discovery_tick();
    assert!(net.core.discovery().directory_entry(&"D".into()).is_none());
    assert!(!connects.iter().any(|connect| connect.address == "10.0.0.4"));

    // A fresh announcement re-creates the entry.
    net.receive(&broker, &announce_message("D", Some(("10.0.0.4", 5665))));
    assert!(net.core.discovery().directory_entry(&"D".into()).is_some());
}

#[test]
fn announce_from_unconfigured_peer_is_filtered_by_roles() {
    let mut net = TestNet::new(NODE_A);
    // "X" is not in the peer list: no roles, not a broker.
    let stranger = net.connect("X");
    net.receive(&stranger, &announce_message("C", Some(("10.0.0.3", 5665))));

    // The entry may exist but carries no permitted topics.
    if let Some(entry) = net.core.discovery().directory_entry(&"C".into()) {
        assert!(entry.publications.is_empty());
        assert!(entry.subscriptions.is_empty());
    }
}

#[test]
fn configured_peers_are_dialed_when_disconnected() {
    let mut net = TestNet::new(NODE_A);
    let connects = net.discovery_tick();

    assert!(connects.contains(&Connect {
        address: "10.0.0.2".to_string(),
        port: 5665,
    }));
    assert!(connects.contains(&Connect {
        address: "10.0.0.9".to_string(),
        port: 5665,
    }));

    // Once connected, no dial is issued for that peer.
    let peer = net.connect("B");
    establish(&mut net, &peer);
    let connects = net.discovery_tick();
    assert!(!connects.iter().any(|connect| connect.address == "10.0.0.2"));
}

#[test]
fn malformed_frames_disconnect_after_threshold() {
    let config = r#"
identity = "A"

[mesh]
violation_threshold = 3
"#;
    let mut net = TestNet::new(config);
    let peer = net.connect("B");

    for _ in 0..3 {
        net.core
            .handle_event(meshmon::daemon::Event::Transport(
                meshmon::mesh::TransportEvent::Frame {
                    conn: peer.conn,
                    body: b"not cbor".to_vec(),
                },
            ));
    }

    assert!(peer.sink.is_closed());
    assert!(net.core.manager().lookup(&"B".into()).is_none());
}
