//! TCP transport: listener, dialer, and per-connection I/O threads.
//!
//! Each connection starts with a single `transport.ident` frame in both
//! directions carrying the peer's identity; only then is the connection
//! surfaced to the daemon core. A reader thread turns frames into events on
//! the core channel, a writer thread drains the outbound queue so the core
//! never blocks on the network.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;

use super::endpoint::FrameSink;
use super::frame::{FrameError, FrameReader, FrameWriter};
use super::identity::{Identity, topics};
use super::proto::{
    Envelope, Payload, Request, WireLimits, decode_envelope, encode_envelope,
};

pub type ConnId = u64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection lost")]
    ConnectionLost,
    #[error("identity handshake failed: {0}")]
    Handshake(String),
    #[error("cannot resolve {0}")]
    Resolve(String),
}

/// Events posted to the daemon core by transport threads.
pub enum TransportEvent {
    /// Identity exchange finished; the connection is usable.
    Connected {
        conn: ConnId,
        identity: Identity,
        sink: Box<dyn FrameSink>,
    },
    /// One decoded-length frame body arrived.
    Frame { conn: ConnId, body: Vec<u8> },
    /// The connection is gone; `error` is None on clean EOF.
    Disconnected {
        conn: ConnId,
        error: Option<String>,
    },
}

struct TcpFrameSink {
    tx: Sender<Vec<u8>>,
    stream: TcpStream,
}

impl FrameSink for TcpFrameSink {
    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| TransportError::ConnectionLost)
    }

    fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

pub struct Transport {
    local_identity: Identity,
    events: Sender<TransportEvent>,
    connect_timeout: Duration,
    next_conn: Arc<AtomicU64>,
}

impl Transport {
    pub fn new(
        local_identity: Identity,
        events: Sender<TransportEvent>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            local_identity,
            events,
            connect_timeout,
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Start an outbound connection attempt. Failures are logged; the
    /// discovery timer retries on its own schedule.
    pub fn dial(&self, address: String, port: u16) {
        let local = self.local_identity.clone();
        let events = self.events.clone();
        let timeout = self.connect_timeout;
        let next_conn = Arc::clone(&self.next_conn);

        std::thread::spawn(move || {
            let target = format!("{address}:{port}");
            let stream = match connect(&target, timeout) {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::info!(target: "transport", %target, %err, "connect failed");
                    return;
                }
            };
            run_connection(stream, local, events, next_conn, timeout);
        });
    }

    /// Accept inbound connections until the shutdown flag flips.
    pub fn listen(
        &self,
        listener: TcpListener,
        shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        listener.set_nonblocking(true)?;
        let local = self.local_identity.clone();
        let events = self.events.clone();
        let timeout = self.connect_timeout;
        let next_conn = Arc::clone(&self.next_conn);

        Ok(std::thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        tracing::debug!(target: "transport", %peer, "accepted connection");
                        let local = local.clone();
                        let events = events.clone();
                        let next_conn = Arc::clone(&next_conn);
                        std::thread::spawn(move || {
                            if stream.set_nonblocking(false).is_err() {
                                return;
                            }
                            run_connection(stream, local, events, next_conn, timeout);
                        });
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    Err(err) => {
                        tracing::warn!(target: "transport", %err, "accept failed");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        }))
    }
}

fn connect(target: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    let mut last_err = None;
    for addr in target
        .to_socket_addrs()
        .map_err(|_| TransportError::Resolve(target.to_string()))?
    {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    match last_err {
        Some(err) => Err(err.into()),
        None => Err(TransportError::Resolve(target.to_string())),
    }
}

/// Identity exchange, then reader/writer threads until the stream dies.
fn run_connection(
    stream: TcpStream,
    local_identity: Identity,
    events: Sender<TransportEvent>,
    next_conn: Arc<AtomicU64>,
    handshake_timeout: Duration,
) {
    let peer_identity = match exchange_ident(&stream, &local_identity, handshake_timeout) {
        Ok(identity) => identity,
        Err(err) => {
            tracing::info!(target: "transport", %err, "identity exchange failed");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    };

    let conn = next_conn.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = unbounded::<Vec<u8>>();

    let write_stream = match stream.try_clone() {
        Ok(clone) => clone,
        Err(err) => {
            tracing::warn!(target: "transport", %err, "stream clone failed");
            return;
        }
    };
    let sink_stream = match stream.try_clone() {
        Ok(clone) => clone,
        Err(err) => {
            tracing::warn!(target: "transport", %err, "stream clone failed");
            return;
        }
    };

    let writer = std::thread::spawn(move || run_writer(write_stream, rx));

    if events
        .send(TransportEvent::Connected {
            conn,
            identity: peer_identity,
            sink: Box::new(TcpFrameSink {
                tx,
                stream: sink_stream,
            }),
        })
        .is_err()
    {
        let _ = stream.shutdown(Shutdown::Both);
        let _ = writer.join();
        return;
    }

    run_reader(stream, conn, &events);
    let _ = writer.join();
}

fn run_writer(mut stream: TcpStream, rx: Receiver<Vec<u8>>) {
    for frame in rx {
        if let Err(err) = stream.write_all(&frame) {
            tracing::debug!(target: "transport", %err, "write failed");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    }
}

fn run_reader(stream: TcpStream, conn: ConnId, events: &Sender<TransportEvent>) {
    let mut reader = FrameReader::new(&stream);
    loop {
        match reader.read_next() {
            Ok(Some(body)) => {
                if events
                    .send(TransportEvent::Frame { conn, body })
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => {
                let _ = events.send(TransportEvent::Disconnected { conn, error: None });
                break;
            }
            Err(err) => {
                let _ = events.send(TransportEvent::Disconnected {
                    conn,
                    error: Some(err.to_string()),
                });
                break;
            }
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Send our `transport.ident`, read the peer's. First frame each way.
fn exchange_ident(
    mut stream: &TcpStream,
    local_identity: &Identity,
    timeout: Duration,
) -> Result<Identity, TransportError> {
    let mut params = super::proto::Params::new();
    params.set_text("identity", local_identity.as_str());
    let hello = Envelope::request(Request::new(topics::TRANSPORT_IDENT).with_params(params));
    let body = encode_envelope(&hello)
        .map_err(|err| TransportError::Handshake(format!("encode: {err}")))?;
    let mut writer = FrameWriter::new(stream);
    writer.write_frame(&body).map_err(|err| match err {
        FrameError::Io(err) => TransportError::Io(err),
        other => TransportError::Handshake(other.to_string()),
    })?;

    stream.set_read_timeout(Some(timeout))?;
    let body = read_one_frame(&mut stream)?;
    stream.set_read_timeout(None)?;

    let envelope = decode_envelope(&body, &WireLimits::default())
        .map_err(|err| TransportError::Handshake(format!("decode: {err}")))?;
    let Payload::Request(request) = envelope.payload else {
        return Err(TransportError::Handshake("expected a request".to_string()));
    };
    if request.method != topics::TRANSPORT_IDENT {
        return Err(TransportError::Handshake(format!(
            "unexpected method {}",
            request.method
        )));
    }
    match request.params.get_text("identity") {
        Some(identity) if !identity.is_empty() => Ok(Identity::from(identity)),
        _ => Err(TransportError::Handshake("missing identity".to_string())),
    }
}

fn read_one_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut frames = FrameReader::new(reader);
    match frames.read_next() {
        Ok(Some(body)) => Ok(body),
        Ok(None) => Err(TransportError::Handshake("peer closed during ident".to_string())),
        Err(FrameError::Io(err)) => Err(TransportError::Io(err)),
        Err(err) => Err(TransportError::Handshake(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn ident_exchange_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            exchange_ident(&stream, &Identity::from("node-b"), Duration::from_secs(5)).unwrap()
        });

        let stream = TcpStream::connect(addr).unwrap();
        let seen_by_client =
            exchange_ident(&stream, &Identity::from("node-a"), Duration::from_secs(5)).unwrap();
        let seen_by_server = server.join().unwrap();

        assert_eq!(seen_by_client, Identity::from("node-b"));
        assert_eq!(seen_by_server, Identity::from("node-a"));
    }

    #[test]
    fn connected_event_carries_peer_identity() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, events_rx) = unbounded();

        let transport = Transport::new(
            Identity::from("node-a"),
            events_tx,
            Duration::from_secs(5),
        );

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            exchange_ident(&stream, &Identity::from("node-b"), Duration::from_secs(5)).unwrap();
            stream
        });

        transport.dial(addr.ip().to_string(), addr.port());

        let event = events_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("connected event");
        match event {
            TransportEvent::Connected { identity, .. } => {
                assert_eq!(identity, Identity::from("node-b"));
            }
            _ => panic!("expected Connected"),
        }
        drop(server.join().unwrap());
    }
}
