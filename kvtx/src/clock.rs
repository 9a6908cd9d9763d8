//! Wall-clock seconds, abstracted so tests can drive `last_updated` and
//! `_date` without sleeping.

use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch")
            .as_secs() as i64
    }
}

/// A clock an individual test can advance by hand. Held by value (not a
/// global), so concurrently-run tests never share or race on it.
#[derive(Clone, Debug)]
pub struct FakeClock {
    now: std::sync::Arc<std::sync::atomic::AtomicI64>,
}

impl FakeClock {
    pub fn at(seconds: i64) -> Self {
        Self {
            now: std::sync::Arc::new(std::sync::atomic::AtomicI64::new(seconds)),
        }
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_secs(&self) -> i64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_independently_of_wall_time() {
        let clock = FakeClock::at(1_000);
        assert_eq!(clock.now_secs(), 1_000);
        clock.advance(60);
        assert_eq!(clock.now_secs(), 1_060);
    }

    #[test]
    fn system_clock_is_plausible() {
        let now = SystemClock.now_secs();
        assert!(now > 1_700_000_000);
    }
}
