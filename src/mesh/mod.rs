//! Peer mesh: endpoints, routing, discovery and delegation.

pub mod checker;
pub mod delegation;
pub mod discovery;
pub mod endpoint;
pub mod frame;
pub mod identity;
pub mod manager;
pub mod permissions;
pub mod proto;
pub mod transport;

pub use checker::Checker;
pub use delegation::{AssignmentState, DelegationEngine};
pub use discovery::{Connect, DirectoryEntry, DiscoveryEngine};
pub use endpoint::{ConnectionState, Endpoint, EndpointId, FrameSink};
pub use identity::{Identity, topics};
pub use manager::{EndpointManager, Notice};
pub use proto::{
    Envelope, Params, Payload, Reply, ReplyResult, Request, WireLimits, decode_envelope,
    encode_envelope,
};
pub use transport::{ConnId, Transport, TransportError, TransportEvent};
