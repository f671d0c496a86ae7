//! Keyed bucket registry.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::bucket::TokenBucket;
use super::policy::BucketPolicy;
use super::store::{BucketStore, Reclaim};

/// Default idle window after which an untouched bucket may be evicted.
pub const DEFAULT_BUCKET_IDLE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Owns the key to bucket mapping for keyed limiters.
///
/// Buckets are created lazily and never duplicated: a miss on the read path
/// is re-checked under the write lock before inserting. The registry does not
/// evict anything by itself; the reclaimer drives idle eviction.
pub struct BucketRegistry {
    /// Buckets indexed by admission key
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
    /// Buckets idle longer than this are dropped on reclaim
    idle_window: Duration,
}

impl BucketRegistry {
    /// Create an empty registry with the default idle window.
    pub fn new() -> Self {
        Self::with_idle_window(DEFAULT_BUCKET_IDLE_WINDOW)
    }

    /// Create an empty registry with a custom idle window.
    pub fn with_idle_window(idle_window: Duration) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            idle_window,
        }
    }

    /// Get or create the bucket for `key`.
    pub fn get_or_create(&self, key: &str, policy: &BucketPolicy) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.read().get(key) {
            trace!(key = %key, "Bucket cache hit");
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write();

        // Double-check after acquiring the write lock
        if let Some(bucket) = buckets.get(key) {
            return Arc::clone(bucket);
        }

        debug!(
            key = %key,
            capacity = policy.capacity,
            refill_tokens = policy.refill.tokens,
            refill_unit = ?policy.refill.unit,
            "Creating new token bucket"
        );
        let bucket = Arc::new(TokenBucket::new(policy));
        buckets.insert(key.to_string(), Arc::clone(&bucket));
        bucket
    }

    /// Get the bucket for `key` if one exists.
    pub fn get(&self, key: &str) -> Option<Arc<TokenBucket>> {
        self.buckets.read().get(key).cloned()
    }

    /// Remove buckets that have been idle longer than `idle_window` as of `now`.
    pub fn evict_idle(&self, now: Instant, idle_window: Duration) -> usize {
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.idle_for(now) <= idle_window);
        before - buckets.len()
    }

    /// The idle window used on reclaim.
    pub fn idle_window(&self) -> Duration {
        self.idle_window
    }

    /// Get the number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }
}

impl Default for BucketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketStore for BucketRegistry {
    fn get_or_create(&self, key: &str, policy: &BucketPolicy) -> Arc<TokenBucket> {
        BucketRegistry::get_or_create(self, key, policy)
    }

    fn len(&self) -> usize {
        self.bucket_count()
    }
}

impl Reclaim for BucketRegistry {
    fn name(&self) -> &'static str {
        "buckets"
    }

    fn reclaim(&self, now: Instant) -> usize {
        self.evict_idle(now, self.idle_window)
    }
}
