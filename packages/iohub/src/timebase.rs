// Shared monotonic timebase
//
// The spawning process reads the host monotonic clock once, passes that
// reading to the hub as its epoch offset, and from then on both processes
// compute `now = monotonic - offset` independently. The offset is written
// once at startup and never changes afterwards.

use crate::error::{HubError, HubResult};
use std::sync::OnceLock;

static GLOBAL_CLOCK: OnceLock<MonotonicClock> = OnceLock::new();

/// Read the host-wide monotonic clock in seconds.
///
/// Unlike `std::time::Instant` this reading is comparable between processes
/// on the same host, which is what makes the shared offset meaningful.
#[cfg(unix)]
pub fn raw_monotonic_secs() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec and CLOCK_MONOTONIC is
    // always available on supported unix targets.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return fallback_secs();
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1_000_000_000.0
}

#[cfg(not(unix))]
pub fn raw_monotonic_secs() -> f64 {
    fallback_secs()
}

// Process-relative; only comparable within one process.
fn fallback_secs() -> f64 {
    static START: OnceLock<std::time::Instant> = OnceLock::new();
    START.get_or_init(std::time::Instant::now).elapsed().as_secs_f64()
}

/// Monotonic clock anchored at an explicit epoch offset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonotonicClock {
    epoch_offset: f64,
}

impl MonotonicClock {
    pub fn new(epoch_offset: f64) -> Self {
        Self { epoch_offset }
    }

    /// Clock whose zero is the current instant.
    pub fn starting_now() -> Self {
        Self::new(raw_monotonic_secs())
    }

    /// Seconds elapsed since the epoch offset.
    pub fn now(&self) -> f64 {
        raw_monotonic_secs() - self.epoch_offset
    }

    pub fn epoch_offset(&self) -> f64 {
        self.epoch_offset
    }
}

/// Install the process-wide clock. May be called once per process.
pub fn install(epoch_offset: f64) -> HubResult<&'static MonotonicClock> {
    let clock = MonotonicClock::new(epoch_offset);
    GLOBAL_CLOCK
        .set(clock)
        .map_err(|_| HubError::TimebaseAlreadyInstalled)?;
    tracing::info!(epoch_offset, "Shared timebase installed");
    Ok(global())
}

/// The process-wide clock; installs one anchored at first use if the
/// process never called [`install`].
pub fn global() -> &'static MonotonicClock {
    GLOBAL_CLOCK.get_or_init(MonotonicClock::starting_now)
}

/// Current time in the shared timebase.
pub fn now() -> f64 {
    global().now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = MonotonicClock::starting_now();
        let a = clock.now();
        let b = clock.now();
        assert!(a >= 0.0);
        assert!(b >= a);
    }

    #[test]
    fn test_two_clocks_with_same_offset_agree() {
        let offset = raw_monotonic_secs() - 5.0;
        let hub = MonotonicClock::new(offset);
        let client = MonotonicClock::new(offset);
        let t_hub = hub.now();
        let t_client = client.now();
        assert!(t_hub >= 5.0);
        assert!((t_client - t_hub).abs() < 0.05);
    }

    #[test]
    fn test_offset_is_preserved() {
        let clock = MonotonicClock::new(12.5);
        assert_eq!(clock.epoch_offset(), 12.5);
    }
}
