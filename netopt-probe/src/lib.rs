//! Gateway quality measurement.
//!
//! The probe engine measures latency, jitter, loss and (optionally) path MTU
//! per `(link, gateway)` pair, with a TTL cache in front so repeated CLI
//! invocations within the cache window don't re-ping. Batch probing fans out
//! over a bounded set of concurrent tasks under an overall deadline; probes
//! that overrun the deadline are recorded as dead rather than failing the
//! batch.

pub mod aspath;
pub mod cache;
pub mod engine;
pub mod mtu;
pub mod ping;
mod probe;

pub use aspath::AsPath;
pub use cache::ProbeCache;
pub use engine::{ProbeEngine, ProbeOptions};
pub use probe::{Probe, ProbeStatus, Source};
