//! Converts per-attempt outcomes into a decision: retry after some delay, or
//! give up and advance to the next candidate source.
//!
//! Grounded on the teacher's `BACKOFF_DELAY` retry loop in `src/fetch.rs`
//! (fixed delay, bounded attempt count), generalized to exponential backoff
//! with full jitter per spec.md §4.4.

use std::time::Duration;

use rand::Rng;

use crate::source::TileResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }

    /// `attempt` is the 1-indexed number of the attempt that just completed.
    pub fn decide(&self, attempt: u32, outcome: &TileResult) -> RetryDecision {
        if !outcome.is_transient() {
            return RetryDecision::GiveUp;
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.backoff_for(attempt))
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis().saturating_mul(1u128 << (attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay.as_millis());
        let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
        Duration::from_millis(jittered as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> TileResult {
        TileResult::Transient { reason: "5xx".into() }
    }

    #[test]
    fn retries_transient_up_to_max_attempts() {
        let policy = RetryPolicy::new(3);
        assert!(matches!(policy.decide(1, &transient()), RetryDecision::RetryAfter(_)));
        assert!(matches!(policy.decide(2, &transient()), RetryDecision::RetryAfter(_)));
        assert_eq!(policy.decide(3, &transient()), RetryDecision::GiveUp);
    }

    #[test]
    fn never_retries_non_transient_outcomes() {
        let policy = RetryPolicy::new(5);
        assert_eq!(policy.decide(1, &TileResult::NotFound), RetryDecision::GiveUp);
        assert_eq!(policy.decide(1, &TileResult::Empty), RetryDecision::GiveUp);
        assert_eq!(
            policy.decide(1, &TileResult::Invalid { reason: "bad".into() }),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn backoff_is_capped_and_never_negative() {
        let policy = RetryPolicy::new(20);
        for attempt in 1..18 {
            if let RetryDecision::RetryAfter(d) = policy.decide(attempt, &transient()) {
                assert!(d <= policy.max_delay);
            }
        }
    }

    #[test]
    fn total_attempts_bounded_by_max_plus_one() {
        // A sequence of Transient outcomes followed by Got should cost at
        // most `retryAttempts + 1` fetch calls.
        let policy = RetryPolicy::new(3);
        let mut attempt = 1;
        let mut calls = 1;
        loop {
            match policy.decide(attempt, &transient()) {
                RetryDecision::RetryAfter(_) => {
                    attempt += 1;
                    calls += 1;
                }
                RetryDecision::GiveUp => break,
            }
        }
        assert!(calls <= policy.max_attempts + 1);
    }
}
