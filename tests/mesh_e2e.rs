//! Two daemons over real TCP: transport handshake, discovery session,
//! delegation round-trip.

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, unbounded};

use meshmon::config;
use meshmon::daemon::{Core, Event, SystemClock, TimeSource};
use meshmon::mesh::{AssignmentState, Identity, Transport, TransportEvent};
use meshmon::objects::{ObjectIndex, Objects};

struct Node {
    core: Core,
    transport: Transport,
    rx: Receiver<TransportEvent>,
}

fn node(config_toml: &str, local_listen: Option<(String, u16)>) -> Node {
    let config = config::load_from_str(config_toml).expect("config");
    let clock: Arc<dyn TimeSource> = Arc::new(SystemClock);
    let objects = ObjectIndex::new(Objects::from_config(&config.objects));
    let (tx, rx) = unbounded();
    let transport = Transport::new(
        Identity::new(config.identity.clone()),
        tx,
        Duration::from_secs(5),
    );
    let core = Core::new(&config, objects, None, clock, local_listen);
    Node {
        core,
        transport,
        rx,
    }
}

impl Node {
    /// Apply queued transport events; returns true if anything happened.
    fn drain(&mut self) -> bool {
        let mut busy = false;
        while let Ok(event) = self.rx.try_recv() {
            busy = true;
            // Dial requests never originate from transport events here.
            self.core.handle_event(Event::Transport(event));
        }
        busy
    }
}

#[test]
fn two_daemons_establish_a_session_and_delegate_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    // Alpha listens, runs no checks itself, and owns the service catalog.
    // It knows beta by identity (for roles); it never dials it.
    let alpha_config = r#"
identity = "alpha"

[mesh]
accepts = []

[mesh.roles.member]
publications = ["discovery.*", "delegation.*"]
subscriptions = ["discovery.*", "delegation.*"]

[[mesh.peers]]
identity = "beta"
address = "127.0.0.1"
port = 1
roles = ["member"]

[[objects.hosts]]
name = "web01"

[[objects.services]]
name = "web-http"
host = "web01"
"#;

    let beta_config = format!(
        r#"
identity = "beta"

[mesh.roles.member]
publications = ["discovery.*", "delegation.*"]
subscriptions = ["discovery.*", "delegation.*"]

[[mesh.peers]]
identity = "alpha"
address = "127.0.0.1"
port = {port}
roles = ["member"]
"#
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut alpha = node(alpha_config, Some(("127.0.0.1".to_string(), port)));
    let listen_thread = alpha
        .transport
        .listen(listener, Arc::clone(&shutdown))
        .unwrap();

    let mut beta = node(&beta_config, None);

    // Beta's discovery timer dials its configured upstream.
    for connect in beta.core.handle_event(Event::DiscoveryTick) {
        if connect.port == port {
            beta.transport.dial(connect.address, connect.port);
        }
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    let assigned = loop {
        let busy = alpha.drain() | beta.drain();

        alpha.core.handle_event(Event::DelegationTick);

        if matches!(
            alpha.core.delegation().assignment("web-http"),
            Some(AssignmentState::Assigned { assignee }) if assignee == &Identity::from("beta")
        ) {
            break true;
        }
        if Instant::now() > deadline {
            break false;
        }
        if !busy {
            std::thread::sleep(Duration::from_millis(10));
        }
    };

    assert!(assigned, "web-http should be delegated to beta over TCP");

    // Both sides see an established session for the other.
    let beta_on_alpha = alpha.core.manager().lookup(&Identity::from("beta")).unwrap();
    assert!(
        alpha
            .core
            .manager()
            .endpoint(beta_on_alpha)
            .unwrap()
            .session_established()
    );
    let alpha_on_beta = beta.core.manager().lookup(&Identity::from("alpha")).unwrap();
    assert!(
        beta.core
            .manager()
            .endpoint(alpha_on_beta)
            .unwrap()
            .session_established()
    );
    assert!(beta.core.checker().is_assigned("web-http"));

    shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    let _ = listen_thread.join();
}
