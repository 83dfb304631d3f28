//! Durable state for netopt: checkpoints of mutable system state, the
//! single-instance transaction lock, the transaction state machine, and the
//! remote-session watchdog.

pub mod checkpoint;
pub mod lock;
pub mod transaction;
pub mod watchdog;

pub use checkpoint::{CheckpointStore, Metadata};
pub use lock::LockFile;
pub use transaction::{Transaction, TxState};
pub use watchdog::Watchdog;
