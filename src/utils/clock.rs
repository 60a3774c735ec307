//! Time helpers.
//!
//! Wall-clock seconds go on the wire and into records; anything that is a
//! duration (RTT, step time, dt) is measured with `Instant`.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Seconds since the UNIX epoch. Returns 0.0 if the system clock is set
/// before 1970.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Wall clock anchored to a monotonic start point.
///
/// `now()` is the epoch time at construction plus the monotonic time elapsed
/// since then, so it stays comparable across processes while never jumping
/// backwards when the system clock is adjusted mid-run.
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    origin: Instant,
    origin_epoch: f64,
}

impl SimClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_epoch: epoch_seconds(),
        }
    }

    pub fn now(&self) -> f64 {
        self.origin_epoch + self.origin.elapsed().as_secs_f64()
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Converts a monotonic instant taken after construction into clock time.
    pub fn at(&self, instant: Instant) -> f64 {
        self.origin_epoch + instant.saturating_duration_since(self.origin).as_secs_f64()
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}
