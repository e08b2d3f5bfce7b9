//! Clock sources for the keyspace engine.
//!
//! The engine reads time through the `Clock` trait so tests can drive
//! expiration and slow-log accounting deterministically. `SystemClock` is the
//! production source; `ManualClock` is a shared, hand-advanced clock whose
//! handle can be cloned into a server and kept by the test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock with microsecond resolution.
pub trait Clock {
    /// Microseconds since the Unix epoch.
    fn now_us(&self) -> u64;

    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64 {
        (self.now_us() / 1000) as i64
    }

    /// Seconds since the Unix epoch.
    fn now_secs(&self) -> u64 {
        self.now_us() / 1_000_000
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock.
///
/// Every read advances the clock by `step_us` (zero by default), which lets a
/// test make time-budgeted loops observe elapsed time without sleeping.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_us: Arc<AtomicU64>,
    step_us: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        ManualClock {
            now_us: Arc::new(AtomicU64::new(start_ms.max(0) as u64 * 1000)),
            step_us: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_us.fetch_add(ms * 1000, Ordering::SeqCst);
    }

    pub fn advance_us(&self, us: u64) {
        self.now_us.fetch_add(us, Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: i64) {
        self.now_us.store(ms.max(0) as u64 * 1000, Ordering::SeqCst);
    }

    /// Advance by `us` on every subsequent read.
    pub fn set_auto_advance_us(&self, us: u64) {
        self.step_us.store(us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        let step = self.step_us.load(Ordering::SeqCst);
        self.now_us.fetch_add(step, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared_handle() {
        let clock = ManualClock::new(1_000);
        let handle = clock.clone();
        handle.advance_ms(250);
        assert_eq!(clock.now_ms(), 1_250);
        handle.set_ms(5_000);
        assert_eq!(clock.now_ms(), 5_000);
    }

    #[test]
    fn test_manual_clock_auto_advance() {
        let clock = ManualClock::new(0);
        clock.set_auto_advance_us(10);
        assert_eq!(clock.now_us(), 0);
        assert_eq!(clock.now_us(), 10);
        assert_eq!(clock.now_us(), 20);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now_secs() > 1_577_836_800);
    }
}
