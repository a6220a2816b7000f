//! An injectable clock so that the piece manager's request staleness horizon
//! (see the `piece_manager` module) can be tested without waiting real
//! wall-clock minutes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A source of "now", abstracted so tests can advance time deterministically.
pub(crate) trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The clock used in production: just forwards to `Instant::now`.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that starts at `Instant::now()` and is advanced manually by tests,
/// letting them simulate the 5 minute staleness horizon elapsing without an
/// actual 5 minute sleep.
#[derive(Clone)]
pub(crate) struct TestClock {
    origin: Instant,
    offset_secs: Arc<AtomicU64>,
}

impl TestClock {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset_secs: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn advance(&self, duration: Duration) {
        self.offset_secs
            .fetch_add(duration.as_secs(), Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.origin + Duration::from_secs(self.offset_secs.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_monotonically() {
        let clock = TestClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(60));
        let t1 = clock.now();
        assert!(t1 > t0);
        assert_eq!(t1 - t0, Duration::from_secs(60));
    }
}
