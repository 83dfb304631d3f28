//! Kernel-facing side of netopt: link inventory and classification, the
//! transactional default-route applicator, and the sysctl/DNS side effects.
//!
//! Everything that mutates the host goes through argv-style subprocess calls
//! (`ip`, `tc`) or direct `/proc/sys` writes; no composed shell strings.

pub mod dns;
pub mod link;
pub mod route;
pub mod sysctl;

pub use link::{ExcludePattern, Inventory, Link, LinkClass};
pub use route::{MultipathRoute, NextHop, RouteBackup};
