//! Status/config exporter for the legacy storage sink.

pub mod exporter;
pub mod records;
pub mod sink;

pub use exporter::Exporter;
pub use records::{Record, typecode};
pub use sink::{RecordSink, SinkError, SinkHandle, TcpSink};
