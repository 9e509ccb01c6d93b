use std::sync::Mutex;
use std::time::Duration;

/// Total silence budget for one logical request.
///
/// Attempts run one after another, so the lock is never contended; it only
/// makes the tracker shareable behind an `Arc`.
#[derive(Debug)]
pub struct IdleTracker {
    total: Duration,
    consumed: Mutex<Duration>,
}

impl IdleTracker {
    pub fn new(total: Duration) -> Self {
        Self {
            total,
            consumed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(*self.lock())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Charges `idle` against the budget and returns what is left.
    pub fn consume(&self, idle: Duration) -> Duration {
        let mut consumed = self.lock();
        *consumed = consumed.saturating_add(idle).min(self.total);
        self.total.saturating_sub(*consumed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Duration> {
        self.consumed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumption_saturates_at_zero() {
        let tracker = IdleTracker::new(Duration::from_secs(10));
        assert_eq!(tracker.consume(Duration::from_secs(4)), Duration::from_secs(6));
        assert!(!tracker.is_exhausted());
        assert_eq!(tracker.consume(Duration::from_secs(30)), Duration::ZERO);
        assert!(tracker.is_exhausted());
        assert_eq!(tracker.remaining(), Duration::ZERO);
    }
}
