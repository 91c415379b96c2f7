//! Outbound status sink.
//!
//! A single writer thread owns the TCP connection to the consumer. The
//! exporter queues rendered records and never blocks the event loop; when
//! the queue is full the record is dropped and counted. The connection is
//! (re)established lazily and the HELLO preamble is replayed after every
//! reconnect.

use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use thiserror::Error;

use crate::daemon::metrics;

/// Anything that accepts rendered records. The exporter writes through this
/// so tests can capture output verbatim.
pub trait RecordSink: Send {
    fn send(&self, payload: String);
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink worker terminated")]
    Terminated,
}

const QUEUE_DEPTH: usize = 1024;
const RECONNECT_HOLDOFF: Duration = Duration::from_secs(5);

enum Command {
    /// Preamble replayed on every (re)connect.
    Hello(String),
    Payload(String),
    Shutdown,
}

pub struct TcpSink {
    tx: Sender<Command>,
    handle: JoinHandle<()>,
}

/// Cloneable producer side of the sink queue.
#[derive(Clone)]
pub struct SinkHandle {
    tx: Sender<Command>,
}

impl TcpSink {
    pub fn spawn(address: String, port: u16, connect_timeout: Duration) -> Self {
        let (tx, rx) = bounded(QUEUE_DEPTH);
        let handle = std::thread::spawn(move || run_worker(address, port, connect_timeout, rx));
        Self { tx, handle }
    }

    pub fn handle(&self) -> SinkHandle {
        SinkHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn set_hello(&self, hello: String) {
        let _ = self.tx.send(Command::Hello(hello));
    }

    /// Stop the worker after draining the queue.
    pub fn shutdown(self) -> Result<(), SinkError> {
        let _ = self.tx.send(Command::Shutdown);
        self.handle.join().map_err(|_| SinkError::Terminated)
    }
}

impl RecordSink for SinkHandle {
    fn send(&self, payload: String) {
        match self.tx.try_send(Command::Payload(payload)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::export_queue_full();
                tracing::debug!(target: "export", "sink queue full; dropping record");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!(target: "export", "sink worker gone; dropping record");
            }
        }
    }
}

struct WorkerState {
    address: String,
    port: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    hello: Option<String>,
    last_attempt: Option<Instant>,
}

fn run_worker(address: String, port: u16, connect_timeout: Duration, rx: Receiver<Command>) {
    let mut state = WorkerState {
        address,
        port,
        connect_timeout,
        stream: None,
        hello: None,
        last_attempt: None,
    };

    for command in rx {
        match command {
            Command::Hello(hello) => {
                state.hello = Some(hello);
                state.write_hello_if_connected();
            }
            Command::Payload(payload) => state.write(&payload),
            Command::Shutdown => break,
        }
    }

    if let Some(stream) = state.stream.take() {
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }
}

impl WorkerState {
    fn write_hello_if_connected(&mut self) {
        if self.stream.is_none() {
            return;
        }
        if let Some(hello) = self.hello.clone() {
            self.write_raw(&hello);
        }
    }

    fn write(&mut self, payload: &str) {
        if self.stream.is_none() && !self.try_connect() {
            tracing::debug!(target: "export", "sink not connected; dropping record");
            return;
        }
        self.write_raw(payload);
    }

    fn write_raw(&mut self, payload: &str) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        if let Err(err) = stream.write_all(payload.as_bytes()) {
            tracing::info!(target: "export", %err, "sink write failed; will reconnect");
            self.stream = None;
        }
    }

    /// Connect, rate-limited, and replay HELLO on success.
    fn try_connect(&mut self) -> bool {
        if let Some(last) = self.last_attempt
            && last.elapsed() < RECONNECT_HOLDOFF
        {
            return false;
        }
        self.last_attempt = Some(Instant::now());

        let target = format!("{}:{}", self.address, self.port);
        let addrs = match target.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(err) => {
                tracing::info!(target: "export", %target, %err, "sink address unresolvable");
                return false;
            }
        };

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    tracing::info!(target: "export", %target, "sink connected");
                    self.stream = Some(stream);
                    if let Some(hello) = self.hello.clone() {
                        self.write_raw(&hello);
                    }
                    return self.stream.is_some();
                }
                Err(err) => {
                    tracing::info!(target: "export", %target, %err, "sink connect failed");
                }
            }
        }
        false
    }
}
