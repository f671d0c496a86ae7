//! Storage traits for limiter state.

use std::sync::Arc;
use tokio::time::Instant;

use super::bucket::TokenBucket;
use super::policy::BucketPolicy;

/// Trait for bucket storage implementations.
///
/// This trait abstracts the keyed bucket map so that admission logic does not
/// depend on where buckets live. The in-process `BucketRegistry` is the only
/// implementation today.
pub trait BucketStore: Send + Sync {
    /// Fetch the bucket for `key`, creating a full one from `policy` on first use.
    fn get_or_create(&self, key: &str, policy: &BucketPolicy) -> Arc<TokenBucket>;

    /// Number of live buckets.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State that the reclaimer can sweep.
pub trait Reclaim: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Drop entries that are idle or expired as of `now`; returns how many were removed.
    fn reclaim(&self, now: Instant) -> usize;
}
