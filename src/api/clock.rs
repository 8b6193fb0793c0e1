//! Wall-clock and replay time sources.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use super::Clock;

/// Real time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn is_live(&self) -> bool {
        true
    }
}

/// Simulated time advanced explicitly by the replay driver.
///
/// Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ReplayClock {
    millis: Arc<AtomicI64>,
}

impl ReplayClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// Move time forward. Attempts to move backwards are ignored.
    pub fn advance_to(&self, at: DateTime<Utc>) {
        self.millis.fetch_max(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ReplayClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn is_live(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_replay_clock_only_moves_forward() {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let clock = ReplayClock::new(start);
        let shared = clock.clone();

        clock.advance_to(start + Duration::minutes(5));
        assert_eq!(shared.now(), start + Duration::minutes(5));

        clock.advance_to(start);
        assert_eq!(shared.now(), start + Duration::minutes(5));
        assert!(!shared.is_live());
    }
}
