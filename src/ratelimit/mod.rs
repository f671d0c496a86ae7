//! Rate limiting logic and state management.

mod bucket;
mod ip_guard;
mod key;
mod policy;
mod reclaimer;
mod registry;
mod store;

pub use bucket::{Consumption, TokenBucket};
pub use ip_guard::{
    GuardDecision, IpGuard, IpGuardSettings, DEFAULT_BLOCK_DURATION, DEFAULT_IDLE_EVICTION,
    DEFAULT_VIOLATION_THRESHOLD, MAX_BLOCK_DURATION,
};
pub use key::{
    client_ip, strip_port, ClientIpKey, ExtensionIdentity, HeaderIdentity, IdentityResolver,
    KeyStrategy, UserEndpointKey, UserId, FORWARDED_FOR_HEADER,
};
pub use policy::{BucketPolicy, PolicyTable, RefillRate, TimeUnit};
pub use reclaimer::{Reclaimer, DEFAULT_CLEANUP_INTERVAL, MAX_CLEANUP_INTERVAL};
pub use registry::{BucketRegistry, DEFAULT_BUCKET_IDLE_WINDOW};
pub use store::{BucketStore, Reclaim};
