//! Restart backoff.

use std::time::Duration;

/// Doubling backoff with a ceiling.
///
/// `next(0)` yields the initial delay; every later call doubles the previous
/// delay until it saturates at the ceiling: 1s, 2s, 4s, 8s, 16s, 30s, 30s, ...
/// The supervisor never resets its backoff during one run, so a restart after
/// a long healthy stretch still waits whatever the loop last reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay used for the first restart.
    pub initial: Duration,
    /// Upper bound for any delay.
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            ceiling: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub const fn new(initial: Duration, ceiling: Duration) -> Self {
        Self { initial, ceiling }
    }

    /// Delay to apply after a wait of `previous`.
    pub fn next(&self, previous: Duration) -> Duration {
        if previous.is_zero() {
            return self.initial.min(self.ceiling);
        }
        previous.saturating_mul(2).min(self.ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.initial, Duration::from_secs(1));
        assert_eq!(policy.ceiling, Duration::from_secs(30));
    }

    #[test]
    fn doubling_sequence_saturates() {
        let policy = BackoffPolicy::default();
        let mut delay = Duration::ZERO;
        let mut seen = Vec::new();
        for _ in 0..8 {
            delay = policy.next(delay);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn never_exceeds_ceiling() {
        let policy = BackoffPolicy::default();
        for secs in [0, 1, 7, 15, 16, 29, 30, 31, 3600, u64::MAX] {
            assert!(policy.next(Duration::from_secs(secs)) <= policy.ceiling);
        }
        assert_eq!(policy.next(Duration::MAX), policy.ceiling);
    }

    #[test]
    fn non_decreasing_until_saturated_then_stable() {
        let policy = BackoffPolicy::default();
        let mut previous = Duration::ZERO;
        let mut saturated = false;
        for _ in 0..20 {
            let next = policy.next(previous);
            assert!(next >= previous);
            if saturated {
                assert_eq!(next, policy.ceiling);
            }
            saturated |= next == policy.ceiling;
            previous = next;
        }
        assert!(saturated);
    }

    #[test]
    fn initial_above_ceiling_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(5));
        assert_eq!(policy.next(Duration::ZERO), Duration::from_secs(5));
    }

    #[test]
    fn millisecond_policy_for_fast_loops() {
        let policy = BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40));
        assert_eq!(policy.next(Duration::ZERO), Duration::from_millis(10));
        assert_eq!(policy.next(Duration::from_millis(10)), Duration::from_millis(20));
        assert_eq!(policy.next(Duration::from_millis(20)), Duration::from_millis(40));
        assert_eq!(policy.next(Duration::from_millis(40)), Duration::from_millis(40));
    }
}
