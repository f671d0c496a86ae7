//! Per-IP rate limiting with escalation to temporary blocks.
//!
//! Each client IP gets a visitor with its own token bucket. Every denial bumps
//! the visitor's consecutive violation count; an allowed request resets it.
//! Once the count exceeds the threshold the visitor is dropped and the IP is
//! put on the block list until `block_duration` has elapsed. Blocked IPs are
//! rejected without touching any bucket, and come back as fresh visitors.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};

use super::bucket::{Consumption, TokenBucket};
use super::policy::{BucketPolicy, RefillRate};
use super::store::Reclaim;

/// Default consecutive denials tolerated before an IP is blocked.
pub const DEFAULT_VIOLATION_THRESHOLD: u32 = 20;
/// Default block length.
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(15 * 60);
/// Default idle window after which a visitor is forgotten.
pub const DEFAULT_IDLE_EVICTION: Duration = Duration::from_secs(5 * 60);
/// Longest block an `IpGuard` will impose.
pub const MAX_BLOCK_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Settings for an `IpGuard`, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpGuardSettings {
    /// Bucket policy applied to every visitor
    pub policy: BucketPolicy,
    /// Consecutive denials allowed before blocking; the next one blocks
    pub violation_threshold: u32,
    /// How long a block lasts, capped at `MAX_BLOCK_DURATION`
    pub block_duration: Duration,
    /// Visitors unseen for longer than this are evicted on reclaim
    pub idle_eviction: Duration,
}

impl Default for IpGuardSettings {
    fn default() -> Self {
        Self {
            policy: BucketPolicy {
                capacity: 20,
                refill: RefillRate::per_second(10),
            },
            violation_threshold: DEFAULT_VIOLATION_THRESHOLD,
            block_duration: DEFAULT_BLOCK_DURATION,
            idle_eviction: DEFAULT_IDLE_EVICTION,
        }
    }
}

/// Result of an admission check for one IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardDecision {
    /// The request may proceed
    pub allowed: bool,
    /// The IP is under an active block
    pub blocked: bool,
    /// Consecutive violations recorded for the IP after this check
    pub violations: u32,
    /// Tokens left in the IP's bucket
    pub remaining: u64,
    /// How long the client should wait before retrying, when denied
    pub retry_after: Option<Duration>,
}

impl GuardDecision {
    fn allowed(remaining: u64) -> Self {
        Self {
            allowed: true,
            blocked: false,
            violations: 0,
            remaining,
            retry_after: None,
        }
    }

    fn limited(violations: u32, retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            blocked: false,
            violations,
            remaining: 0,
            retry_after,
        }
    }

    fn blocked(violations: u32, wait: Duration) -> Self {
        Self {
            allowed: false,
            blocked: true,
            violations,
            remaining: 0,
            retry_after: Some(wait),
        }
    }
}

/// Rate limiter state for one client IP.
///
/// Idle time is the bucket's: every admitted or denied request consumes from it.
#[derive(Debug)]
struct Visitor {
    bucket: TokenBucket,
    consecutive_violations: u32,
}

/// An active penalty on one IP.
#[derive(Debug, Clone, Copy)]
struct Block {
    unblock_at: Instant,
    /// Violations accumulated when the block was imposed
    violations: u32,
}

#[derive(Debug, Default)]
struct GuardState {
    visitors: HashMap<String, Visitor>,
    blocked: HashMap<String, Block>,
}

/// Tracks visitors and the block list behind a single lock.
///
/// Every critical section is a handful of map operations; logging happens
/// after the lock is released.
#[derive(Debug)]
pub struct IpGuard {
    settings: IpGuardSettings,
    state: Mutex<GuardState>,
}

impl IpGuard {
    pub fn new(mut settings: IpGuardSettings) -> Self {
        settings.block_duration = settings.block_duration.min(MAX_BLOCK_DURATION);
        Self {
            settings,
            state: Mutex::new(GuardState::default()),
        }
    }

    pub fn settings(&self) -> &IpGuardSettings {
        &self.settings
    }

    /// Check and record a request from `ip`.
    pub fn allow(&self, ip: &str) -> GuardDecision {
        self.allow_at(ip, Instant::now())
    }

    /// Check and record a request from `ip` as of `now`.
    pub fn allow_at(&self, ip: &str, now: Instant) -> GuardDecision {
        let mut escalated = false;
        let decision = {
            let mut state = self.state.lock();

            if let Some(&block) = state.blocked.get(ip) {
                if block.unblock_at > now {
                    return GuardDecision::blocked(block.violations, block.unblock_at - now);
                }
                state.blocked.remove(ip);
            }

            let policy = &self.settings.policy;
            let visitor = state
                .visitors
                .entry(ip.to_string())
                .or_insert_with(|| Visitor {
                    bucket: TokenBucket::new_at(policy, now),
                    consecutive_violations: 0,
                });

            match visitor.bucket.consume_at(now) {
                Consumption::Allowed { remaining } => {
                    visitor.consecutive_violations = 0;
                    GuardDecision::allowed(remaining)
                }
                Consumption::Denied { retry_after } => {
                    visitor.consecutive_violations =
                        visitor.consecutive_violations.saturating_add(1);
                    let violations = visitor.consecutive_violations;

                    if violations > self.settings.violation_threshold {
                        let unblock_at = self.unblock_at(now);
                        state.visitors.remove(ip);
                        state.blocked.insert(
                            ip.to_string(),
                            Block {
                                unblock_at,
                                violations,
                            },
                        );
                        escalated = true;
                        GuardDecision::blocked(violations, unblock_at - now)
                    } else {
                        GuardDecision::limited(violations, retry_after)
                    }
                }
            }
        };

        if escalated {
            error!(
                ip = %ip,
                violations = decision.violations,
                block_secs = self.settings.block_duration.as_secs(),
                "IP blocked after repeated rate limit violations"
            );
        }

        decision
    }

    /// When a block imposed at `now` ends.
    fn unblock_at(&self, now: Instant) -> Instant {
        now.checked_add(self.settings.block_duration)
            .unwrap_or_else(|| now + DEFAULT_BLOCK_DURATION)
    }

    /// Whether `ip` is currently blocked.
    pub fn is_blocked(&self, ip: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .blocked
            .get(ip)
            .is_some_and(|block| block.unblock_at > now)
    }

    /// Lift a block early. Returns `true` if the IP was on the block list.
    pub fn unblock(&self, ip: &str) -> bool {
        let removed = self.state.lock().blocked.remove(ip).is_some();
        if removed {
            debug!(ip = %ip, "Block lifted");
        }
        removed
    }

    /// Consecutive violations currently recorded for `ip`.
    pub fn violations(&self, ip: &str) -> Option<u32> {
        self.state
            .lock()
            .visitors
            .get(ip)
            .map(|v| v.consecutive_violations)
    }

    /// Number of tracked visitors.
    pub fn visitor_count(&self) -> usize {
        self.state.lock().visitors.len()
    }

    /// Number of entries on the block list, expired or not.
    pub fn blocked_count(&self) -> usize {
        self.state.lock().blocked.len()
    }

    /// Drop idle visitors and expired blocks; returns `(visitors, blocks)` removed.
    pub fn sweep(&self, now: Instant) -> (usize, usize) {
        let idle = self.settings.idle_eviction;
        let mut state = self.state.lock();

        let visitors_before = state.visitors.len();
        state
            .visitors
            .retain(|_, v| v.bucket.idle_for(now) <= idle);

        let blocks_before = state.blocked.len();
        state.blocked.retain(|_, block| block.unblock_at > now);

        (
            visitors_before - state.visitors.len(),
            blocks_before - state.blocked.len(),
        )
    }
}

impl Default for IpGuard {
    fn default() -> Self {
        Self::new(IpGuardSettings::default())
    }
}

impl Reclaim for IpGuard {
    fn name(&self) -> &'static str {
        "ip_guard"
    }

    fn reclaim(&self, now: Instant) -> usize {
        let (visitors, blocks) = self.sweep(now);
        if visitors + blocks > 0 {
            debug!(visitors, blocks, "Swept idle visitors and expired blocks");
        }
        visitors + blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::TimeUnit;

    const IP: &str = "203.0.113.7";

    /// One token, effectively no refill.
    fn strict_settings() -> IpGuardSettings {
        IpGuardSettings {
            policy: BucketPolicy {
                capacity: 1,
                refill: RefillRate::new(1, TimeUnit::Day),
            },
            ..IpGuardSettings::default()
        }
    }

    /// Exhaust the bucket and rack up `n` violations.
    fn deny_times(guard: &IpGuard, n: u32, now: Instant) {
        for i in 1..=n {
            let decision = guard.allow_at(IP, now);
            assert!(!decision.allowed);
            assert!(!decision.blocked, "blocked early at violation {}", i);
            assert_eq!(decision.violations, i);
        }
    }

    #[test]
    fn test_first_request_is_allowed() {
        let guard = IpGuard::default();
        let decision = guard.allow(IP);
        assert!(decision.allowed);
        assert!(!decision.blocked);
        assert_eq!(guard.visitor_count(), 1);
    }

    #[test]
    fn test_denial_reports_violation_and_retry_after() {
        let guard = IpGuard::new(strict_settings());
        let now = Instant::now();
        assert!(guard.allow_at(IP, now).allowed);

        let decision = guard.allow_at(IP, now);
        assert_eq!(decision, GuardDecision::limited(1, Some(TimeUnit::Day.duration())));
        assert_eq!(guard.violations(IP), Some(1));
    }

    #[test]
    fn test_threshold_violations_escalate_to_block() {
        let guard = IpGuard::new(strict_settings());
        let now = Instant::now();
        assert!(guard.allow_at(IP, now).allowed);

        // 20 consecutive denials are tolerated
        deny_times(&guard, DEFAULT_VIOLATION_THRESHOLD, now);
        assert!(!guard.is_blocked(IP));

        // The next denial exceeds the threshold and blocks
        let decision = guard.allow_at(IP, now);
        assert!(!decision.allowed);
        assert!(decision.blocked);
        assert_eq!(decision.violations, DEFAULT_VIOLATION_THRESHOLD + 1);
        assert_eq!(decision.retry_after, Some(DEFAULT_BLOCK_DURATION));
        assert_eq!(guard.visitor_count(), 0);
        assert_eq!(guard.blocked_count(), 1);

        // Subsequent requests within the block window stay blocked
        let later = now + Duration::from_secs(60);
        let decision = guard.allow_at(IP, later);
        assert!(decision.blocked);
        assert_eq!(decision.violations, DEFAULT_VIOLATION_THRESHOLD + 1);
        assert_eq!(
            decision.retry_after,
            Some(DEFAULT_BLOCK_DURATION - Duration::from_secs(60))
        );
        assert_eq!(guard.visitor_count(), 0);
    }

    #[test]
    fn test_blocked_regardless_of_token_state() {
        let guard = IpGuard::new(IpGuardSettings {
            policy: BucketPolicy {
                capacity: 1,
                refill: RefillRate::per_second(1),
            },
            violation_threshold: 2,
            ..IpGuardSettings::default()
        });
        let now = Instant::now();
        assert!(guard.allow_at(IP, now).allowed);
        deny_times(&guard, 2, now);
        assert!(guard.allow_at(IP, now).blocked);

        // Plenty of time for the bucket to refill, but the block still holds
        let decision = guard.allow_at(IP, now + Duration::from_secs(30));
        assert!(!decision.allowed);
        assert!(decision.blocked);
    }

    #[test]
    fn test_allowed_request_resets_violations() {
        let guard = IpGuard::new(IpGuardSettings {
            policy: BucketPolicy {
                capacity: 1,
                refill: RefillRate::per_second(1),
            },
            ..IpGuardSettings::default()
        });
        let now = Instant::now();
        assert!(guard.allow_at(IP, now).allowed);
        deny_times(&guard, 5, now);

        assert!(guard.allow_at(IP, now + Duration::from_secs(1)).allowed);
        assert_eq!(guard.violations(IP), Some(0));
    }

    #[test]
    fn test_expired_block_yields_fresh_visitor() {
        let guard = IpGuard::new(strict_settings());
        let now = Instant::now();
        assert!(guard.allow_at(IP, now).allowed);
        deny_times(&guard, DEFAULT_VIOLATION_THRESHOLD, now);
        assert!(guard.allow_at(IP, now).blocked);

        let after = now + DEFAULT_BLOCK_DURATION;
        let decision = guard.allow_at(IP, after);
        assert!(decision.allowed);
        assert!(!decision.blocked);
        assert_eq!(guard.violations(IP), Some(0));
        // Lazy removal on lookup
        assert_eq!(guard.blocked_count(), 0);
    }

    #[test]
    fn test_ips_are_isolated() {
        let guard = IpGuard::new(strict_settings());
        let now = Instant::now();
        assert!(guard.allow_at(IP, now).allowed);
        assert!(!guard.allow_at(IP, now).allowed);
        assert!(guard.allow_at("198.51.100.1", now).allowed);
    }

    #[test]
    fn test_unblock_lifts_block() {
        let guard = IpGuard::new(IpGuardSettings {
            violation_threshold: 0,
            ..strict_settings()
        });
        assert!(guard.allow(IP).allowed);
        assert!(guard.allow(IP).blocked);
        assert!(guard.is_blocked(IP));

        assert!(guard.unblock(IP));
        assert!(!guard.is_blocked(IP));
        assert!(guard.allow(IP).allowed);
    }

    #[test]
    fn test_sweep_evicts_idle_visitors() {
        let guard = IpGuard::new(strict_settings());
        let now = Instant::now();
        assert!(guard.allow_at(IP, now).allowed);
        assert!(!guard.allow_at(IP, now).allowed);

        let active = now + Duration::from_secs(200);
        guard.allow_at("198.51.100.1", active);

        let later = now + DEFAULT_IDLE_EVICTION + Duration::from_secs(1);
        assert_eq!(guard.sweep(later), (1, 0));
        assert_eq!(guard.visitor_count(), 1);

        // Evicted visitor starts over at full capacity
        let decision = guard.allow_at(IP, later);
        assert!(decision.allowed);
        assert_eq!(guard.violations(IP), Some(0));
    }

    #[test]
    fn test_allowed_decision_reports_remaining_tokens() {
        let guard = IpGuard::default();
        let now = Instant::now();
        assert_eq!(guard.allow_at(IP, now).remaining, 19);
        assert_eq!(guard.allow_at(IP, now).remaining, 18);
    }

    #[test]
    fn test_oversized_block_duration_is_capped() {
        let guard = IpGuard::new(IpGuardSettings {
            violation_threshold: 1,
            block_duration: Duration::MAX,
            ..strict_settings()
        });
        assert_eq!(guard.settings().block_duration, MAX_BLOCK_DURATION);

        let now = Instant::now();
        assert!(guard.allow_at(IP, now).allowed);
        deny_times(&guard, 1, now);
        let decision = guard.allow_at(IP, now);
        assert!(decision.blocked);
        assert_eq!(decision.retry_after, Some(MAX_BLOCK_DURATION));
        assert!(guard.allow_at(IP, now + Duration::from_secs(3600)).blocked);
    }

    #[test]
    fn test_violation_count_saturates() {
        let guard = IpGuard::new(IpGuardSettings {
            violation_threshold: u32::MAX,
            ..strict_settings()
        });
        let now = Instant::now();
        assert!(guard.allow_at(IP, now).allowed);
        deny_times(&guard, 1, now);
        guard
            .state
            .lock()
            .visitors
            .get_mut(IP)
            .unwrap()
            .consecutive_violations = u32::MAX;

        let decision = guard.allow_at(IP, now);
        assert!(!decision.allowed);
        assert!(!decision.blocked);
        assert_eq!(decision.violations, u32::MAX);
    }

    #[test]
    fn test_sweep_removes_expired_blocks() {
        let guard = IpGuard::new(IpGuardSettings {
            violation_threshold: 0,
            ..strict_settings()
        });
        let now = Instant::now();
        assert!(guard.allow_at(IP, now).allowed);
        assert!(guard.allow_at(IP, now).blocked);

        assert_eq!(guard.sweep(now + Duration::from_secs(60)), (0, 0));
        assert_eq!(guard.reclaim(now + DEFAULT_BLOCK_DURATION), 1);
        assert_eq!(guard.blocked_count(), 0);
    }
}
