//! Shared harness: a daemon core wired to scripted in-memory peers.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use meshmon::config::{self, Config};
use meshmon::daemon::{Core, Event, TestClock, TimeSource};
use meshmon::mesh::{
    ConnId, Connect, Envelope, FrameSink, Params, Payload, Reply, ReplyResult, Request,
    TransportError, TransportEvent, WireLimits, decode_envelope, encode_envelope, topics,
};
use meshmon::objects::{ObjectIndex, Objects};

/// Captures every frame the core writes to one peer connection.
#[derive(Clone, Default)]
pub struct PeerSink {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl PeerSink {
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            // Strip the 8-byte frame header; the body is the envelope.
            .map(|frame| decode_envelope(&frame[8..], &WireLimits::default()).unwrap())
            .collect()
    }

    pub fn requests(&self, method: &str) -> Vec<Request> {
        self.envelopes()
            .into_iter()
            .filter_map(|envelope| match envelope.payload {
                Payload::Request(request) if request.method == method => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

impl FrameSink for PeerSink {
    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionLost);
        }
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct Peer {
    pub conn: ConnId,
    pub sink: PeerSink,
}

pub struct TestNet {
    pub core: Core,
    pub clock: TestClock,
    next_conn: ConnId,
}

impl TestNet {
    pub fn new(config_toml: &str) -> Self {
        let config: Config = config::load_from_str(config_toml).expect("test config");
        let clock = TestClock::new(1_000_000);
        let objects = ObjectIndex::new(Objects::from_config(&config.objects));
        let core = Core::new(
            &config,
            objects,
            None,
            Arc::new(clock.clone()) as Arc<dyn TimeSource>,
            None,
        );
        Self {
            core,
            clock,
            next_conn: 1,
        }
    }

    /// Simulate a completed transport handshake from `identity`.
    pub fn connect(&mut self, identity: &str) -> Peer {
        let conn = self.next_conn;
        self.next_conn += 1;
        let sink = PeerSink::default();
        self.core.handle_event(Event::Transport(TransportEvent::Connected {
            conn,
            identity: identity.into(),
            sink: Box::new(sink.clone()),
        }));
        Peer { conn, sink }
    }

    pub fn disconnect(&mut self, peer: &Peer) {
        self.core
            .handle_event(Event::Transport(TransportEvent::Disconnected {
                conn: peer.conn,
                error: Some("connection reset".to_string()),
            }));
    }

    /// Deliver an envelope as if it arrived on the peer's connection.
    pub fn receive(&mut self, peer: &Peer, envelope: &Envelope) {
        let body = encode_envelope(envelope).expect("encode");
        self.core.handle_event(Event::Transport(TransportEvent::Frame {
            conn: peer.conn,
            body,
        }));
    }

    pub fn discovery_tick(&mut self) -> Vec<Connect> {
        self.core.handle_event(Event::DiscoveryTick)
    }

    pub fn delegation_tick(&mut self) {
        self.core.handle_event(Event::DelegationTick);
    }
}

/// `discovery.register` advertising a typical checker peer.
pub fn register_message() -> Envelope {
    let mut params = Params::new();
    params
        .set_list(
            "publications",
            [
                topics::DISCOVERY_REGISTER,
                topics::DISCOVERY_ANNOUNCE,
                topics::DISCOVERY_WELCOME,
            ],
        )
        .set_list(
            "subscriptions",
            [
                topics::DISCOVERY_REGISTER,
                topics::DISCOVERY_ANNOUNCE,
                topics::DISCOVERY_WELCOME,
                topics::DELEGATION_ASSIGN,
                topics::DELEGATION_CLEAR,
            ],
        );
    Envelope::request(Request::new(topics::DISCOVERY_REGISTER).with_params(params))
}

/// `discovery.announce` about a third party.
pub fn announce_message(identity: &str, address: Option<(&str, u16)>) -> Envelope {
    let mut params = Params::new();
    params
        .set_text("identity", identity)
        .set_list(
            "publications",
            [topics::DISCOVERY_REGISTER, topics::DISCOVERY_ANNOUNCE],
        )
        .set_list(
            "subscriptions",
            [
                topics::DISCOVERY_REGISTER,
                topics::DISCOVERY_ANNOUNCE,
                topics::DISCOVERY_WELCOME,
                topics::DELEGATION_ASSIGN,
            ],
        );
    if let Some((node, port)) = address {
        params.set_text("node", node).set_u64("service", u64::from(port));
    }
    Envelope::request(Request::new(topics::DISCOVERY_ANNOUNCE).with_params(params))
}

pub fn welcome_message() -> Envelope {
    Envelope::request(Request::new(topics::DISCOVERY_WELCOME))
}

pub fn accept_reply(request_id: u64, accepted: bool) -> Envelope {
    let mut params = Params::new();
    params.set_bool("accepted", accepted);
    Envelope::reply(Reply {
        id: request_id,
        result: ReplyResult::Ok(params),
    })
}

/// Drive the register + welcome exchange so the peer reaches an established
/// session with the daemon under test.
pub fn establish(net: &mut TestNet, peer: &Peer) {
    net.receive(peer, &register_message());
    net.receive(peer, &welcome_message());
}
