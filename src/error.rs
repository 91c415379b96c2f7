use thiserror::Error;

use crate::config::ConfigError;
use crate::export::SinkError;
use crate::mesh::TransportError;

/// Crate-level convenience error.
///
/// Runtime failures inside a component are handled (and logged) where they
/// occur; this type only carries the failures that abort startup or shutdown.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
