//! Background sweep of idle limiter state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::store::Reclaim;

/// Default time between sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Longest time between sweeps.
pub const MAX_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Periodically evicts idle buckets, idle visitors and expired blocks.
///
/// Eviction races benignly with request workers: a key swept here and touched
/// again right after is simply recreated at full capacity.
pub struct Reclaimer {
    interval: Duration,
    targets: Vec<Arc<dyn Reclaim>>,
}

impl Reclaimer {
    /// Create a reclaimer with no targets. The interval is capped at `MAX_CLEANUP_INTERVAL`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.min(MAX_CLEANUP_INTERVAL),
            targets: Vec::new(),
        }
    }

    /// Add a target to sweep.
    pub fn watch(mut self, target: Arc<dyn Reclaim>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one sweep over every target; returns the total number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut total = 0;
        for target in &self.targets {
            let removed = target.reclaim(now);
            if removed > 0 {
                debug!(target = target.name(), removed, "Reclaimed idle state");
            }
            total += removed;
        }
        total
    }

    /// Sweep every `interval` until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            interval_secs = self.interval.as_secs(),
            targets = self.targets.len(),
            "Starting reclaimer"
        );

        let now = Instant::now();
        let start = now.checked_add(self.interval).unwrap_or(now);
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Reclaimer stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        info!(removed, "Reclaimer sweep complete");
                    }
                }
            }
        }
    }

    /// Spawn the sweep loop on the tokio runtime.
    pub fn spawn<F>(self, shutdown: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(self.run(shutdown))
    }
}
