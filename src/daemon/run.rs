//! Daemon runner.
//!
//! Wires configuration, transport, timers and signals around the core event
//! loop. This function does not return until a shutdown signal arrives.

use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{select, tick, unbounded};

use crate::Result;
use crate::config::Config;
use crate::export::{Exporter, TcpSink};
use crate::mesh::{Identity, Transport, TransportEvent};
use crate::objects::{ObjectIndex, Objects};

use super::clock::{SystemClock, TimeSource};
use super::core::{Core, Event};

/// Run the daemon in the current process.
pub fn run_daemon(config: Config, config_path: Option<&Path>) -> Result<()> {
    let clock: Arc<dyn TimeSource> = Arc::new(SystemClock);
    let identity = Identity::new(config.identity.clone());
    let objects = ObjectIndex::new(Objects::from_config(&config.objects));

    // Status sink and exporter, when enabled.
    let mut sink = None;
    let exporter = if config.export.enabled {
        let tcp = TcpSink::spawn(
            config.export.socket_address.clone(),
            config.export.socket_port,
            config.mesh.connect_timeout(),
        );
        let exporter = Exporter::new(
            Box::new(tcp.handle()),
            clock.now_ms(),
            std::process::id(),
        );
        tcp.set_hello(exporter.hello_payload(&config.export.instance_name));
        sink = Some(tcp);
        Some(exporter)
    } else {
        None
    };

    // Signals: SIGINT/SIGTERM stop the daemon, SIGHUP reloads the objects.
    let shutdown = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&reload));

    // Transport threads feed the event loop through this channel.
    let (transport_tx, transport_rx) = unbounded::<TransportEvent>();
    let transport = Transport::new(identity, transport_tx, config.mesh.connect_timeout());

    let local_listen = config
        .listen_addr
        .as_deref()
        .and_then(parse_listen_addr);
    let listener_thread = match &config.listen_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr)?;
            tracing::info!(target: "mesh", %addr, "listening for peers");
            Some(transport.listen(listener, Arc::clone(&shutdown))?)
        }
        None => None,
    };

    let mut core = Core::new(&config, objects.clone(), exporter, clock, local_listen);

    let discovery_tick = tick(config.mesh.discovery_interval());
    let delegation_tick = tick(config.mesh.delegation_interval());
    let status_tick = tick(config.export.status_interval());
    let program_status_tick = tick(config.export.program_status_interval());
    let config_tick = tick(config.export.config_interval());
    let shutdown_poll = tick(Duration::from_millis(200));

    tracing::info!(identity = config.identity.as_str(), "daemon started");

    // Fire every timer once right away, like a fresh schedule at zero.
    for event in [
        Event::DiscoveryTick,
        Event::DelegationTick,
        Event::StatusTick,
        Event::ProgramStatusTick,
        Event::ConfigTick,
    ] {
        for connect in core.handle_event(event) {
            transport.dial(connect.address, connect.port);
        }
    }

    loop {
        let mut connects = Vec::new();
        select! {
            recv(transport_rx) -> msg => match msg {
                Ok(event) => connects = core.handle_event(Event::Transport(event)),
                Err(_) => break,
            },
            recv(discovery_tick) -> _ => {
                connects = core.handle_event(Event::DiscoveryTick);
            }
            recv(delegation_tick) -> _ => {
                connects = core.handle_event(Event::DelegationTick);
            }
            recv(status_tick) -> _ => {
                connects = core.handle_event(Event::StatusTick);
            }
            recv(program_status_tick) -> _ => {
                connects = core.handle_event(Event::ProgramStatusTick);
            }
            recv(config_tick) -> _ => {
                connects = core.handle_event(Event::ConfigTick);
            }
            recv(shutdown_poll) -> _ => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if reload.swap(false, Ordering::Relaxed) {
                    reload_objects(config_path, &objects);
                }
            }
        }
        for connect in connects {
            transport.dial(connect.address, connect.port);
        }
    }

    tracing::info!("shutting down");
    shutdown.store(true, Ordering::Relaxed);
    core.shutdown();
    if let Some(sink) = sink {
        sink.shutdown()?;
    }
    if let Some(thread) = listener_thread {
        let _ = thread.join();
    }
    Ok(())
}

fn parse_listen_addr(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}

/// SIGHUP: re-read the config file and swap the object graph. The mesh
/// topology is left alone; a bad file keeps the old objects.
fn reload_objects(config_path: Option<&Path>, objects: &ObjectIndex) {
    let Some(path) = config_path else {
        tracing::warn!("reload requested but no config file to re-read");
        return;
    };
    match crate::config::load(path) {
        Ok(config) => {
            objects.reload(Objects::from_config(&config.objects));
            tracing::info!(path = %path.display(), "objects reloaded");
        }
        Err(err) => {
            tracing::warn!(%err, "reload failed; keeping previous objects");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_parsing() {
        assert_eq!(
            parse_listen_addr("0.0.0.0:5665"),
            Some(("0.0.0.0".to_string(), 5665))
        );
        assert_eq!(parse_listen_addr("no-port"), None);
        assert_eq!(parse_listen_addr("host:not-a-port"), None);
    }
}
