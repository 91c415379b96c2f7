#![forbid(unsafe_code)]

pub mod config;
pub mod daemon;
pub mod error;
pub mod export;
pub mod mesh;
pub mod objects;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::mesh::{
    DelegationEngine, DiscoveryEngine, Endpoint, EndpointId, EndpointManager, Envelope, Identity,
    Params, Payload,
};
