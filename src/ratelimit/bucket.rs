//! Token bucket state and the greedy refill computation.

use serde::{Deserialize, Serialize};

use super::rules::RefillRule;

/// Persisted state of one client's bucket.
///
/// `available_tokens` never exceeds `capacity`; it grows only through
/// [`refill`](Self::refill) and shrinks only through [`try_consume`](Self::try_consume).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketState {
    pub capacity: u64,
    pub available_tokens: u64,
    /// Logical time (nanoseconds since the Unix epoch) up to which refill
    /// has been accounted for.
    pub last_refill_nanos: u64,
    /// Sub-nanosecond part of the accounted time, in units of
    /// `1 / refill_amount` nanoseconds. Always below `refill_amount`.
    pub refill_residue: u64,
}

/// Outcome of one consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionVerdict {
    pub consumed: bool,
    pub remaining_tokens: u64,
}

impl BucketState {
    /// A full bucket created at `now`.
    pub fn full(rule: &RefillRule, now: u64) -> Self {
        Self {
            capacity: rule.capacity,
            available_tokens: rule.capacity,
            last_refill_nanos: now,
            refill_residue: 0,
        }
    }

    /// Add the whole tokens earned since the last refill.
    ///
    /// Only the time accounted for by whole tokens is consumed from the
    /// elapsed interval, tracked exactly down to fractions of a nanosecond;
    /// the remainder carries over to the next call. A clock reading earlier
    /// than the last refill adds nothing.
    pub fn refill(&mut self, rule: &RefillRule, now: u64) {
        if self.capacity != rule.capacity {
            self.capacity = rule.capacity;
            self.available_tokens = self.available_tokens.min(self.capacity);
        }

        if now <= self.last_refill_nanos {
            return;
        }

        if self.available_tokens >= self.capacity {
            self.mark_full(now);
            return;
        }

        let period = rule.refill_period.as_nanos();
        let amount = u128::from(rule.refill_amount);
        let residue = u128::from(self.refill_residue).min(amount - 1);

        // Elapsed time in units of 1/amount nanoseconds
        let elapsed_units = (u128::from(now - self.last_refill_nanos) * amount).saturating_sub(residue);
        let earned = elapsed_units / period;
        if earned == 0 {
            return;
        }

        let room = u128::from(self.capacity - self.available_tokens);
        if earned >= room {
            self.available_tokens = self.capacity;
            self.mark_full(now);
        } else {
            self.available_tokens += earned as u64;
            let accounted_units = residue + earned * period;
            self.last_refill_nanos += (accounted_units / amount) as u64;
            self.refill_residue = (accounted_units % amount) as u64;
        }
    }

    fn mark_full(&mut self, now: u64) {
        self.last_refill_nanos = now;
        self.refill_residue = 0;
    }

    /// Take `tokens` if enough are available. Leaves the state unchanged otherwise.
    pub fn try_consume(&mut self, tokens: u64) -> bool {
        if self.available_tokens >= tokens {
            self.available_tokens -= tokens;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SECOND: u64 = 1_000_000_000;
    const T0: u64 = 1_700_000_000 * SECOND;

    fn rule(capacity: u64, refill_amount: u64, period_secs: u64) -> RefillRule {
        RefillRule::new(capacity, refill_amount, Duration::from_secs(period_secs)).unwrap()
    }

    #[test]
    fn test_full_bucket() {
        let state = BucketState::full(&rule(5, 5, 60), T0);
        assert_eq!(state.available_tokens, 5);
        assert_eq!(state.capacity, 5);
        assert_eq!(state.last_refill_nanos, T0);
    }

    #[test]
    fn test_consume_until_empty() {
        let mut state = BucketState::full(&rule(5, 5, 60), T0);
        for _ in 0..5 {
            assert!(state.try_consume(1));
        }
        assert!(!state.try_consume(1));
        assert_eq!(state.available_tokens, 0);
    }

    #[test]
    fn test_consume_more_than_available_leaves_state() {
        let mut state = BucketState::full(&rule(5, 5, 60), T0);
        assert!(state.try_consume(3));
        let before = state;
        assert!(!state.try_consume(3));
        assert_eq!(state, before);
    }

    #[test]
    fn test_refill_after_full_period() {
        let r = rule(5, 5, 60);
        let mut state = BucketState::full(&r, T0);
        for _ in 0..5 {
            state.try_consume(1);
        }

        state.refill(&r, T0 + 60 * SECOND);
        assert_eq!(state.available_tokens, 5);
        assert_eq!(state.last_refill_nanos, T0 + 60 * SECOND);
    }

    #[test]
    fn test_refill_is_proportional_and_capped() {
        let r = rule(10, 2, 10);
        let mut state = BucketState {
            capacity: 10,
            available_tokens: 0,
            last_refill_nanos: T0,
            refill_residue: 0,
        };

        for k in 1..=7u64 {
            let mut later = state;
            later.refill(&r, T0 + k * 10 * SECOND);
            assert_eq!(later.available_tokens, (k * 2).min(10));
        }

        state.refill(&r, T0 + 1000 * SECOND);
        assert_eq!(state.available_tokens, 10);
    }

    #[test]
    fn test_fractional_remainder_carries_forward() {
        // One token every 3 seconds
        let r = rule(10, 1, 3);
        let mut state = BucketState {
            capacity: 10,
            available_tokens: 0,
            last_refill_nanos: T0,
            refill_residue: 0,
        };

        // 2s: nothing earned, timestamp untouched
        state.refill(&r, T0 + 2 * SECOND);
        assert_eq!(state.available_tokens, 0);
        assert_eq!(state.last_refill_nanos, T0);

        // 4s: one token, 1s of remainder kept
        state.refill(&r, T0 + 4 * SECOND);
        assert_eq!(state.available_tokens, 1);
        assert_eq!(state.last_refill_nanos, T0 + 3 * SECOND);

        // 6s: the carried second completes the second token
        state.refill(&r, T0 + 6 * SECOND);
        assert_eq!(state.available_tokens, 2);
        assert_eq!(state.last_refill_nanos, T0 + 6 * SECOND);
    }

    #[test]
    fn test_many_small_refills_match_one_large_refill() {
        let r = rule(1000, 7, 13);
        let mut stepped = BucketState {
            capacity: 1000,
            available_tokens: 0,
            last_refill_nanos: T0,
            refill_residue: 0,
        };
        let mut single = stepped;

        let mut now = T0;
        for _ in 0..500 {
            now += SECOND / 3;
            stepped.refill(&r, now);
        }
        single.refill(&r, now);

        assert_eq!(stepped.available_tokens, single.available_tokens);
    }

    #[test]
    fn test_sub_nanosecond_token_interval_keeps_exact_remainder() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        // Nine tokens every ten nanoseconds
        let r = RefillRule::new(1_000_000, 9, Duration::from_nanos(10)).unwrap();
        let mut stepped = BucketState {
            capacity: 1_000_000,
            available_tokens: 0,
            last_refill_nanos: T0,
            refill_residue: 0,
        };
        let mut single = stepped;

        let mut rng = StdRng::seed_from_u64(42);
        let mut now = T0;
        for _ in 0..20_000 {
            now += rng.gen_range(1..=7);
            stepped.refill(&r, now);
            assert!(stepped.refill_residue < 9);
        }
        single.refill(&r, now);

        assert_eq!(stepped.available_tokens, single.available_tokens);
        assert_eq!(single.available_tokens, (now - T0) * 9 / 10);
    }

    #[test]
    fn test_negative_elapsed_is_ignored() {
        let r = rule(5, 5, 60);
        let mut state = BucketState {
            capacity: 5,
            available_tokens: 1,
            last_refill_nanos: T0,
            refill_residue: 0,
        };
        state.refill(&r, T0 - 30 * SECOND);
        assert_eq!(state.available_tokens, 1);
        assert_eq!(state.last_refill_nanos, T0);
    }

    #[test]
    fn test_capacity_change_clamps_tokens() {
        let mut state = BucketState::full(&rule(10, 1, 1), T0);
        state.refill(&rule(4, 1, 1), T0);
        assert_eq!(state.capacity, 4);
        assert_eq!(state.available_tokens, 4);
    }
}
