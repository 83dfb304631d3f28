//! Process-wide monotonic clock.
//!
//! Probe freshness and event timestamps are measured against a single origin
//! captured on first use, so ages computed in different modules agree.

use std::{
    sync::OnceLock,
    time::{Instant, SystemTime},
};

static ORIGIN: OnceLock<Instant> = OnceLock::new();

fn origin() -> Instant {
    *ORIGIN.get_or_init(Instant::now)
}

/// Microseconds elapsed since the first clock access in this process.
#[inline]
pub fn monotonic_micros() -> u64 {
    origin().elapsed().as_micros() as u64
}

/// Returns the current UNIX timestamp in microseconds.
#[inline]
pub fn unix_micros() -> u64 {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_micros() as u64
}
