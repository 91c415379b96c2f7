//! Daemon module - the meshmon service.
//!
//! Provides:
//! - the core event loop coordinating mesh, delegation and export
//! - wall-clock abstraction for deterministic tests
//! - metrics emission helpers
//! - the process runner (signals, timers, transport wiring)

pub mod clock;
pub mod core;
pub mod metrics;
pub mod run;

pub use clock::{SystemClock, TestClock, TimeSource};
pub use run::run_daemon;
pub use self::core::{Core, Event};
