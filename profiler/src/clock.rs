use std::{
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;

/// Source of wall-clock time, in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> f64;
}

/// Reads the system clock once and then advances with a monotonic
/// [`Instant`], so readings never go backwards.
pub struct SystemClock {
    origin: Instant,
    origin_epoch_ms: f64,
}

impl SystemClock {
    pub fn new() -> Self {
        let origin_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64() * 1000.0)
            .unwrap_or_default();

        Self {
            origin: Instant::now(),
            origin_epoch_ms,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        self.origin_epoch_ms + self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new(start_ms: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: f64) {
        *self.now.lock() += ms;
    }

    /// Moves the clock to `ms`. Ignored if `ms` lies in the past.
    pub fn set(&self, ms: f64) {
        let mut now = self.now.lock();
        if ms > *now {
            *now = ms;
        }
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now_ms();
        let second = clock.now_ms();
        assert!(second >= first);
        assert!(first > 1_600_000_000_000.0);
    }

    #[test]
    fn manual_clock_shares_time_between_clones() {
        let clock = ManualClock::new(1000.0);
        let other = clock.clone();

        clock.advance(250.0);
        assert_eq!(other.now_ms(), 1250.0);

        other.set(1200.0);
        assert_eq!(clock.now_ms(), 1250.0);
        other.set(2000.0);
        assert_eq!(clock.now_ms(), 2000.0);
    }
}
