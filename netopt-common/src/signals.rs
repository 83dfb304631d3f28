//! Deferring operator interrupts during rollback.
//!
//! The rollback path must run to completion even if the controlling process
//! receives SIGINT/SIGTERM (an operator mashing ctrl-C mid-rollback would
//! otherwise leave the routing table half-restored).

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// While this guard is alive, SIGINT and SIGTERM are ignored.
/// Previous dispositions are restored on drop.
pub struct DeferGuard {
    previous: Vec<(Signal, SigAction)>,
}

/// Ignore SIGINT/SIGTERM until the returned guard is dropped.
pub fn defer_interrupts() -> DeferGuard {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let mut previous = Vec::with_capacity(2);

    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // Safety: installing SIG_IGN carries no handler re-entrancy concerns.
        match unsafe { sigaction(signal, &ignore) } {
            Ok(prior) => previous.push((signal, prior)),
            Err(e) => tracing::warn!(?signal, ?e, "failed to defer signal"),
        }
    }

    DeferGuard { previous }
}

impl Drop for DeferGuard {
    fn drop(&mut self) {
        for (signal, prior) in self.previous.drain(..) {
            // Safety: restoring the previously observed disposition.
            if let Err(e) = unsafe { sigaction(signal, &prior) } {
                tracing::warn!(?signal, ?e, "failed to restore signal disposition");
            }
        }
    }
}
