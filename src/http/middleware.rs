//! Admission middleware for axum routers.
//!
//! Two adapters are provided. `KeyedLimiter` buckets requests on a key derived
//! by a `KeyStrategy` (typically user and endpoint) and never fails a request
//! because no key could be derived. `IpLimiter` buckets on the client IP and
//! escalates repeat offenders to a temporary block through an `IpGuard`.
//!
//! ```ignore
//! let limiter = Arc::new(KeyedLimiter::new(
//!     UserEndpointKey::new("checkout", Arc::new(ExtensionIdentity)),
//!     BucketPolicy::checkout(),
//!     registry,
//! ));
//! let app = Router::new()
//!     .route("/checkout", post(checkout))
//!     .layer(middleware::from_fn_with_state(limiter, keyed_rate_limit::<UserEndpointKey>));
//! ```

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

use super::rejection::{BlockResponse, Quota, Rejection};
use crate::error::KeyResolutionError;
use crate::ratelimit::{
    BucketPolicy, BucketStore, ClientIpKey, Consumption, IpGuard, KeyStrategy,
};

/// Rate limits requests per derived key against a shared bucket store.
pub struct KeyedLimiter<K> {
    strategy: K,
    policy: BucketPolicy,
    store: Arc<dyn BucketStore>,
}

impl<K: KeyStrategy> KeyedLimiter<K> {
    pub fn new(strategy: K, policy: BucketPolicy, store: Arc<dyn BucketStore>) -> Self {
        Self {
            strategy,
            policy,
            store,
        }
    }

    pub fn policy(&self) -> &BucketPolicy {
        &self.policy
    }

    /// Decide whether `req` may proceed, returning the quota it was charged to.
    ///
    /// Requests without a derivable key are let through uncharged: rate
    /// limiting is a second line of defense, not a condition of request validity.
    pub fn check(&self, req: &Request) -> Result<Option<Quota>, Rejection> {
        let key = match self.strategy.derive_key(req) {
            Ok(key) => key,
            Err(err) => {
                log_unresolved(&err, req);
                return Ok(None);
            }
        };

        let limit = self.policy.capacity;
        let bucket = self.store.get_or_create(&key, &self.policy);
        match bucket.consume() {
            Consumption::Allowed { remaining } => {
                trace!(key = %key, remaining, "Request admitted");
                Ok(Some(Quota { limit, remaining }))
            }
            Consumption::Denied { retry_after } => {
                warn!(key = %key, path = %req.uri().path(), "Rate limit exceeded");
                Err(Rejection::RateLimitExceeded { limit, retry_after })
            }
        }
    }
}

/// Rate limits requests per client IP with escalation to temporary blocks.
pub struct IpLimiter {
    guard: Arc<IpGuard>,
    block_response: BlockResponse,
}

impl IpLimiter {
    pub fn new(guard: Arc<IpGuard>) -> Self {
        Self {
            guard,
            block_response: BlockResponse::default(),
        }
    }

    /// Choose the status returned to blocked IPs.
    pub fn with_block_response(mut self, block_response: BlockResponse) -> Self {
        self.block_response = block_response;
        self
    }

    pub fn guard(&self) -> &Arc<IpGuard> {
        &self.guard
    }

    /// Decide whether `req` may proceed, returning the quota it was charged to.
    pub fn check(&self, req: &Request) -> Result<Option<Quota>, Rejection> {
        let ip = match ClientIpKey.derive_key(req) {
            Ok(ip) => ip,
            Err(err) => {
                log_unresolved(&err, req);
                return Ok(None);
            }
        };

        let limit = self.guard.settings().policy.capacity;
        let decision = self.guard.allow(&ip);
        if decision.allowed {
            return Ok(Some(Quota {
                limit,
                remaining: decision.remaining,
            }));
        }

        if decision.blocked {
            warn!(
                ip = %ip,
                violations = decision.violations,
                path = %req.uri().path(),
                "Blocked IP attempted access"
            );
            Err(Rejection::IpBlocked {
                limit,
                retry_after: decision.retry_after,
                response: self.block_response,
            })
        } else {
            warn!(
                ip = %ip,
                violations = decision.violations,
                path = %req.uri().path(),
                "Rate limit hit"
            );
            Err(Rejection::TooManyRequests {
                limit,
                retry_after: decision.retry_after,
            })
        }
    }
}

async fn admit(checked: Result<Option<Quota>, Rejection>, req: Request, next: Next) -> Response {
    match checked {
        Ok(quota) => {
            let mut response = next.run(req).await;
            if let Some(quota) = quota {
                quota.apply(response.headers_mut());
            }
            response
        }
        Err(rejection) => rejection.into_response(),
    }
}

fn log_unresolved(err: &KeyResolutionError, req: &Request) {
    match err {
        KeyResolutionError::MissingIdentity => {
            debug!(path = %req.uri().path(), "No identity on request, skipping rate limit");
        }
        _ => {
            warn!(
                error = %err,
                path = %req.uri().path(),
                "Failed to derive rate limit key, allowing request"
            );
        }
    }
}

/// Middleware applying a `KeyedLimiter`. Use with `axum::middleware::from_fn_with_state`.
#[instrument(level = "trace", skip_all, fields(path = %req.uri().path()))]
pub async fn keyed_rate_limit<K>(
    State(limiter): State<Arc<KeyedLimiter<K>>>,
    req: Request,
    next: Next,
) -> Response
where
    K: KeyStrategy + 'static,
{
    let checked = limiter.check(&req);
    admit(checked, req, next).await
}

/// Middleware applying an `IpLimiter`. Use with `axum::middleware::from_fn_with_state`.
#[instrument(level = "trace", skip_all, fields(path = %req.uri().path()))]
pub async fn ip_rate_limit(
    State(limiter): State<Arc<IpLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let checked = limiter.check(&req);
    admit(checked, req, next).await
}
