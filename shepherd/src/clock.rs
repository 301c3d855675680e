use std::fmt;

use chrono::{DateTime, Utc};

/// Source of wall-clock time for lease stamping and expiry checks.
///
/// Lease expiry is decided by comparing `lock_until` against the caller's
/// observation time, so every component that stamps or reads a lease takes
/// its notion of "now" from a shared clock rather than calling `Utc::now`
/// directly.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
