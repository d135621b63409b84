//! Time source abstraction.
//!
//! Heartbeat and backoff logic reads the current time through this trait
//! instead of calling `SystemTime::now()`/`Instant::now()` directly, so
//! tests can advance a fake clock instead of sleeping in real time.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Monotonic instant, used for interval and timeout arithmetic.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch, used for wire timestamps.
    fn unix_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A deterministic clock for tests, in this crate and downstream ones.
pub mod fake {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// A clock whose `now()`/`unix_millis()` only move when told to.
    pub struct FakeClock {
        base_instant: Instant,
        offset_ms: Mutex<i64>,
    }

    impl FakeClock {
        pub fn new() -> Self {
            Self {
                base_instant: Instant::now(),
                offset_ms: Mutex::new(0),
            }
        }

        pub fn advance(&self, duration: Duration) {
            *self.offset_ms.lock().unwrap() += duration.as_millis() as i64;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            self.base_instant + Duration::from_millis(*self.offset_ms.lock().unwrap() as u64)
        }

        fn unix_millis(&self) -> i64 {
            *self.offset_ms.lock().unwrap()
        }
    }

    #[test]
    fn advancing_moves_both_clocks_in_lockstep() {
        let clock = FakeClock::new();
        let t0 = clock.now();
        let ms0 = clock.unix_millis();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now().duration_since(t0).as_secs(), 5);
        assert_eq!(clock.unix_millis() - ms0, 5000);
    }
}
