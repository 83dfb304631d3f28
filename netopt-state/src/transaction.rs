//! The commit-or-rollback envelope around one apply.
//!
//! A transaction pairs the pre-apply checkpoint, the route backup and the
//! instance lock into a single unit with an explicit state machine:
//!
//! ```text
//! IDLE ──begin──→ OPEN ──apply_ok──→ APPLIED ──confirm──→ COMMITTED
//!                   │                   │
//!                   └──apply_fail──→ ROLLED_BACK ←──reject / watchdog──┘
//!
//! any failure during rollback → FATAL
//! ```
//!
//! Exactly one resolution per transaction; every other transition is a
//! programming error surfaced as [`Error::InvalidTransition`].

use serde::Serialize;

use netopt_net::route::RouteBackup;

use crate::lock::LockFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Open,
    Applied,
    Committed,
    RolledBack,
    Fatal,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Fatal)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid transaction transition: {from:?} → {to:?}")]
    InvalidTransition { from: TxState, to: TxState },
}

pub type Result<T> = std::result::Result<T, Error>;

/// One in-flight apply. Holds the lock for its whole lifetime.
#[derive(Debug)]
pub struct Transaction {
    state: TxState,
    pub checkpoint_id: Option<String>,
    pub backup: RouteBackup,
    _lock: LockFile,
}

impl Transaction {
    /// `begin`: IDLE → OPEN. The lock must already be held; the checkpoint
    /// (when checkpointing is enabled) must already exist on disk.
    pub fn begin(lock: LockFile, backup: RouteBackup, checkpoint_id: Option<String>) -> Self {
        tracing::debug!(?checkpoint_id, entries = backup.entries.len(), "transaction open");
        Self { state: TxState::Open, checkpoint_id, backup, _lock: lock }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// OPEN → APPLIED.
    pub fn mark_applied(&mut self) -> Result<()> {
        self.transition(TxState::Open, TxState::Applied)
    }

    /// APPLIED → COMMITTED (terminal).
    pub fn commit(&mut self) -> Result<()> {
        self.transition(TxState::Applied, TxState::Committed)
    }

    /// OPEN or APPLIED → ROLLED_BACK (terminal).
    pub fn roll_back(&mut self) -> Result<()> {
        match self.state {
            TxState::Open | TxState::Applied => {
                tracing::info!(from = ?self.state, "transaction rolled back");
                self.state = TxState::RolledBack;
                Ok(())
            }
            from => Err(Error::InvalidTransition { from, to: TxState::RolledBack }),
        }
    }

    /// Any state → FATAL (terminal). Only reached when a rollback itself
    /// failed and the system state is indeterminate.
    pub fn mark_fatal(&mut self) {
        tracing::error!(from = ?self.state, "transaction fatal");
        self.state = TxState::Fatal;
    }

    fn transition(&mut self, expect: TxState, to: TxState) -> Result<()> {
        if self.state != expect {
            return Err(Error::InvalidTransition { from: self.state, to });
        }
        tracing::debug!(?expect, ?to, "transaction transition");
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction() -> (tempfile::TempDir, Transaction) {
        let tmp = tempfile::tempdir().unwrap();
        let lock = LockFile::acquire(tmp.path().join("lock")).unwrap();
        let tx = Transaction::begin(lock, RouteBackup::default(), Some("pre_x".to_string()));
        (tmp, tx)
    }

    #[test]
    fn happy_path_commits_once() {
        let (_tmp, mut tx) = transaction();
        assert_eq!(tx.state(), TxState::Open);

        tx.mark_applied().unwrap();
        assert_eq!(tx.state(), TxState::Applied);

        tx.commit().unwrap();
        assert_eq!(tx.state(), TxState::Committed);
        assert!(tx.state().is_terminal());

        // A second resolution is invalid.
        assert!(tx.commit().is_err());
        assert!(tx.roll_back().is_err());
    }

    #[test]
    fn apply_failure_rolls_back_from_open() {
        let (_tmp, mut tx) = transaction();
        tx.roll_back().unwrap();
        assert_eq!(tx.state(), TxState::RolledBack);
        assert!(tx.mark_applied().is_err());
    }

    #[test]
    fn watchdog_fire_rolls_back_from_applied() {
        let (_tmp, mut tx) = transaction();
        tx.mark_applied().unwrap();
        tx.roll_back().unwrap();
        assert_eq!(tx.state(), TxState::RolledBack);
    }

    #[test]
    fn cannot_commit_without_apply() {
        let (_tmp, mut tx) = transaction();
        assert!(matches!(
            tx.commit(),
            Err(Error::InvalidTransition { from: TxState::Open, to: TxState::Committed })
        ));
    }

    #[test]
    fn fatal_is_reachable_from_anywhere_and_sticky() {
        let (_tmp, mut tx) = transaction();
        tx.mark_applied().unwrap();
        tx.mark_fatal();
        assert_eq!(tx.state(), TxState::Fatal);
        assert!(tx.commit().is_err());
        assert!(tx.roll_back().is_err());
    }

    #[test]
    fn transaction_holds_the_lock_for_its_lifetime() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("lock");
        let lock = LockFile::acquire(&lock_path).unwrap();
        let tx = Transaction::begin(lock, RouteBackup::default(), None);

        assert!(LockFile::acquire(&lock_path).is_err(), "lock must be held by the transaction");
        drop(tx);
        assert!(LockFile::acquire(&lock_path).is_ok());
    }
}
