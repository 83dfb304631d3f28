//! Shared plumbing for the netopt workspace.
//!
//! Everything here is deliberately small: a monotonic clock, a subprocess
//! runner with a hard deadline, structured event emission, and signal
//! deferral for the rollback path. All subsystems that shell out to external
//! tools (`ip`, `ping`, `mtr`, `sysctl`, `tc`, `ethtool`) go through
//! [`cmd::run`] so that timeouts and cancellation have a single code path.

pub mod clock;
pub mod cmd;
pub mod events;
pub mod signals;

pub use events::{Event, EventBuffer, EventSink, Level};
