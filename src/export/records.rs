//! Record framing for the status sink.
//!
//! The consumer is a legacy data-out daemon with a fixed numeric schema:
//! every record is `typecode:`, `key=value` lines, a `999` terminator and a
//! blank line. The preamble and farewell use `KEY: value` lines instead.
//! None of the numbers here are ours to change.

use std::fmt::{Display, Write};

/// Externally mandated record typecodes.
pub mod typecode {
    pub const PROGRAM_STATUS: u32 = 211;
    pub const HOST_STATUS: u32 = 212;
    pub const SERVICE_STATUS: u32 = 213;
    pub const HOST_DEFINITION: u32 = 400;
    pub const HOSTGROUP_DEFINITION: u32 = 401;
    pub const SERVICE_DEFINITION: u32 = 402;
    pub const SERVICEGROUP_DEFINITION: u32 = 403;
    pub const CONFIG_DUMP_START: u32 = 900;
    pub const CONFIG_DUMP_END: u32 = 901;
    pub const END_OF_RECORD: u32 = 999;
    pub const END_OF_DATA: u32 = 1000;
}

/// One `typecode:` record under construction.
pub struct Record {
    buf: String,
}

impl Record {
    pub fn new(typecode: u32) -> Self {
        Self {
            buf: format!("\n{typecode}:\n"),
        }
    }

    /// Start/end sentinels are framed with an extra leading blank line.
    pub fn sentinel(typecode: u32) -> Self {
        Self {
            buf: format!("\n\n{typecode}:\n"),
        }
    }

    pub fn field(mut self, key: u32, value: impl Display) -> Self {
        let _ = writeln!(self.buf, "{key}={value}");
        self
    }

    pub fn finish(mut self) -> String {
        let _ = write!(self.buf, "{}\n\n", typecode::END_OF_RECORD);
        self.buf
    }
}

/// Wire timestamp: seconds since the epoch with sub-second precision.
pub fn timestamp(now_ms: u64) -> f64 {
    now_ms as f64 / 1000.0
}

/// HELLO preamble, sent once per sink connection.
pub fn hello(instance_name: &str, start_secs: u64) -> String {
    let mut buf = String::new();
    let _ = write!(
        buf,
        "\n\nHELLO\n\
         PROTOCOL: 2\n\
         AGENT: MESHMON\n\
         AGENTVERSION: {version}\n\
         STARTTIME: {start_secs}\n\
         DISPOSITION: REALTIME\n\
         CONNECTION: TCPSOCKET\n\
         INSTANCENAME: {instance_name}\n\
         STARTDATADUMP\n\n",
        version = env!("CARGO_PKG_VERSION"),
    );
    buf
}

/// GOODBYE farewell: end-of-data sentinel, end time, goodbye marker.
pub fn goodbye(end_secs: u64) -> String {
    format!(
        "\n{end}\nENDTIME: {end_secs}\nGOODBYE\n\n",
        end = typecode::END_OF_DATA,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_is_exact() {
        let record = Record::new(typecode::HOST_STATUS)
            .field(4, timestamp(1_700_000_000_500))
            .field(53, "web01")
            .finish();

        assert_eq!(record, "\n212:\n4=1700000000.5\n53=web01\n999\n\n");
    }

    #[test]
    fn sentinel_has_leading_blank_line() {
        let record = Record::sentinel(typecode::CONFIG_DUMP_START)
            .field(245, "RETAINED")
            .finish();
        assert!(record.starts_with("\n\n900:\n245=RETAINED\n"));
        assert!(record.ends_with("999\n\n"));
    }

    #[test]
    fn hello_carries_protocol_and_instance() {
        let hello = hello("i2-default", 1_700_000_000);
        assert!(hello.starts_with("\n\nHELLO\nPROTOCOL: 2\n"));
        assert!(hello.contains("INSTANCENAME: i2-default\n"));
        assert!(hello.contains("STARTTIME: 1700000000\n"));
        assert!(hello.ends_with("STARTDATADUMP\n\n"));
    }

    #[test]
    fn goodbye_carries_end_sentinel() {
        let goodbye = goodbye(1_700_000_060);
        assert_eq!(goodbye, "\n1000\nENDTIME: 1700000060\nGOODBYE\n\n");
    }

    #[test]
    fn timestamps_keep_subsecond_precision() {
        assert_eq!(format!("{}", timestamp(1_700_000_000_250)), "1700000000.25");
        assert_eq!(format!("{}", timestamp(1_700_000_000_000)), "1700000000");
    }
}
