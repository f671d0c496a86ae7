//! Token bucket implementation.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::policy::{BucketPolicy, RefillRate};

/// Outcome of a single consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// A token was taken.
    Allowed {
        /// Tokens left after this consumption
        remaining: u64,
    },
    /// The bucket was empty.
    Denied {
        /// Time until the next whole token is refilled, if the bucket refills at all
        retry_after: Option<Duration>,
    },
}

impl Consumption {
    /// Whether the consumption was allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Consumption::Allowed { .. })
    }
}

/// Mutable state of a bucket, always accessed under its lock.
#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
    last_seen: Instant,
}

/// A token bucket granting `capacity` operations that refill at a fixed rate.
///
/// Refill and consumption for one bucket are serialized by a lock owned by the
/// bucket, so concurrent callers on the same key never share a token.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill: RefillRate,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket for the given policy.
    pub fn new(policy: &BucketPolicy) -> Self {
        Self::new_at(policy, Instant::now())
    }

    /// Create a full bucket whose refill clock starts at `now`.
    pub fn new_at(policy: &BucketPolicy, now: Instant) -> Self {
        Self {
            capacity: policy.capacity,
            refill: policy.refill,
            state: Mutex::new(BucketState {
                tokens: policy.capacity,
                last_refill: now,
                last_seen: now,
            }),
        }
    }

    /// Refill, then try to take one token. Returns `true` if a token was taken.
    pub fn try_consume(&self) -> bool {
        self.consume().is_allowed()
    }

    /// Refill, then try to take one token.
    pub fn consume(&self) -> Consumption {
        self.consume_at(Instant::now())
    }

    /// Refill as of `now`, then try to take one token.
    pub fn consume_at(&self, now: Instant) -> Consumption {
        let mut state = self.state.lock();
        self.refill_locked(&mut state, now);
        if now > state.last_seen {
            state.last_seen = now;
        }

        if state.tokens > 0 {
            state.tokens -= 1;
            Consumption::Allowed {
                remaining: state.tokens,
            }
        } else {
            Consumption::Denied {
                retry_after: self.next_token_in(&state, now),
            }
        }
    }

    /// Tokens currently available, after applying refill as of now.
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill_locked(&mut state, Instant::now());
        state.tokens
    }

    /// The capacity of this bucket.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The refill rate of this bucket.
    pub fn refill(&self) -> RefillRate {
        self.refill
    }

    /// How long the bucket has gone without a consumption attempt.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let state = self.state.lock();
        now.saturating_duration_since(state.last_seen)
    }

    /// Add whole tokens earned since the last refill.
    ///
    /// `last_refill` only moves when at least one token is added; the
    /// fractional remainder of elapsed time is dropped.
    fn refill_locked(&self, state: &mut BucketState, now: Instant) {
        let period = self.refill.unit.duration().as_nanos();
        if self.refill.tokens == 0 || period == 0 {
            return;
        }

        let elapsed = now.saturating_duration_since(state.last_refill).as_nanos();
        let added = elapsed.saturating_mul(self.refill.tokens as u128) / period;
        if added > 0 {
            let refilled = (state.tokens as u128).saturating_add(added);
            state.tokens = refilled.min(self.capacity as u128) as u64;
            state.last_refill = now;
        }
    }

    /// Time until refill yields the next whole token.
    fn next_token_in(&self, state: &BucketState, now: Instant) -> Option<Duration> {
        if self.refill.tokens == 0 {
            return None;
        }
        let period = self.refill.unit.duration().as_nanos();
        let per_token = period.div_ceil(self.refill.tokens as u128);
        let elapsed = now.saturating_duration_since(state.last_refill).as_nanos();
        let wait = per_token.saturating_sub(elapsed);
        Some(Duration::from_nanos(wait.min(u64::MAX as u128) as u64))
    }
}
