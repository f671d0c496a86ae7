//! Composition root: limiter state and the routes it protects.
//!
//! Every limiter is an explicitly constructed object owned by `AppState`, so
//! tests and embedders can build as many independent instances as they need.

use axum::middleware;
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

use super::middleware::{ip_rate_limit, keyed_rate_limit, IpLimiter, KeyedLimiter};
use crate::config::FloodgateConfig;
use crate::error::Result;
use crate::ratelimit::{
    BucketRegistry, ClientIpKey, ExtensionIdentity, HeaderIdentity, IdentityResolver, IpGuard,
    KeyStrategy, PolicyTable, Reclaimer, UserEndpointKey,
};

/// Shared limiter state for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    /// Global per-IP limiter, when enabled
    pub ip_limiter: Option<Arc<IpLimiter>>,
    /// Buckets for the per-user endpoint limiters
    pub user_buckets: Arc<BucketRegistry>,
    /// Buckets for the per-IP webhook limiter
    pub webhook_buckets: Arc<BucketRegistry>,
    /// Endpoint policies
    pub policies: PolicyTable,
    /// Where user ids come from
    pub identity: Arc<dyn IdentityResolver>,
}

impl AppState {
    /// Build all limiter state from configuration.
    pub fn from_config(config: &FloodgateConfig) -> Result<Self> {
        let ip_limiter = if config.ip_guard.enabled {
            let guard = Arc::new(IpGuard::new(config.ip_guard.settings()?));
            Some(Arc::new(
                IpLimiter::new(guard).with_block_response(config.ip_guard.block_response),
            ))
        } else {
            None
        };

        let identity: Arc<dyn IdentityResolver> = match &config.server.identity_header {
            Some(header) => Arc::new(HeaderIdentity::new(header.as_str())),
            None => Arc::new(ExtensionIdentity),
        };

        let idle = config.reclaimer.bucket_idle_eviction();
        Ok(Self {
            ip_limiter,
            user_buckets: Arc::new(BucketRegistry::with_idle_window(idle)),
            webhook_buckets: Arc::new(BucketRegistry::with_idle_window(idle)),
            policies: config.policies.clone(),
            identity,
        })
    }

    /// A reclaimer watching every piece of state this app owns.
    pub fn reclaimer(&self, config: &FloodgateConfig) -> Reclaimer {
        let mut reclaimer = Reclaimer::new(config.reclaimer.cleanup_interval())
            .watch(self.user_buckets.clone())
            .watch(self.webhook_buckets.clone());
        if let Some(limiter) = &self.ip_limiter {
            reclaimer = reclaimer.watch(limiter.guard().clone());
        }
        reclaimer
    }

    /// Per-user limiter for a named endpoint policy.
    fn user_limiter(&self, endpoint: &str) -> Result<Arc<KeyedLimiter<UserEndpointKey>>> {
        Ok(Arc::new(KeyedLimiter::new(
            UserEndpointKey::new(endpoint, self.identity.clone()),
            self.policies.require(endpoint)?,
            self.user_buckets.clone(),
        )))
    }
}

fn limited<K>(route: MethodRouter<AppState>, limiter: Arc<KeyedLimiter<K>>) -> MethodRouter<AppState>
where
    K: KeyStrategy + 'static,
{
    route.layer(middleware::from_fn_with_state(limiter, keyed_rate_limit::<K>))
}

/// Build the router with every limiter wired in.
pub fn build_router(state: AppState) -> Result<Router> {
    let webhook_limiter = Arc::new(KeyedLimiter::new(
        ClientIpKey,
        state.policies.require("webhook")?,
        state.webhook_buckets.clone(),
    ));

    let mut router = Router::new()
        .route("/healthz", get(health))
        .route(
            "/checkout",
            limited(post(checkout), state.user_limiter("checkout")?),
        )
        .route(
            "/subscriptions",
            limited(
                get(subscriptions).post(subscriptions),
                state.user_limiter("subscription")?,
            ),
        )
        .route(
            "/subscriptions/portal",
            limited(post(portal), state.user_limiter("portal")?),
        )
        .route("/webhooks/stripe", limited(post(webhook), webhook_limiter));

    if let Some(limiter) = state.ip_limiter.clone() {
        router = router.layer(middleware::from_fn_with_state(limiter, ip_rate_limit));
    }

    Ok(router.with_state(state))
}

// The handlers below stand in for the business layer behind the limiters.

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn checkout() -> Json<Value> {
    Json(json!({ "endpoint": "checkout", "status": "accepted" }))
}

async fn subscriptions() -> Json<Value> {
    Json(json!({ "endpoint": "subscription", "status": "accepted" }))
}

async fn portal() -> Json<Value> {
    Json(json!({ "endpoint": "portal", "status": "accepted" }))
}

async fn webhook() -> Json<Value> {
    Json(json!({ "endpoint": "webhook", "status": "received" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Method, Request, StatusCode};
    use std::net::SocketAddr;
    use tower::ServiceExt;

    fn request(method: Method, uri: &str, user: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo("192.0.2.10:51000".parse::<SocketAddr>().unwrap()));
        req
    }

    fn app() -> Router {
        let mut config = FloodgateConfig::default();
        config.server.identity_header = Some("x-user-id".to_string());
        build_router(AppState::from_config(&config).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let response = app()
            .oneshot(request(Method::GET, "/healthz", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_portal_policy_applies_per_user() {
        let app = app();

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(request(Method::POST, "/subscriptions/portal", Some("u1")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(request(Method::POST, "/subscriptions/portal", Some("u1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // Another endpoint for the same user has its own bucket
        let response = app
            .clone()
            .oneshot(request(Method::POST, "/checkout", Some("u1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unauthenticated_checkout_is_not_limited_per_user() {
        let app = app();
        for _ in 0..8 {
            let response = app
                .clone()
                .oneshot(request(Method::POST, "/checkout", None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_ip_limiter_wraps_all_routes() {
        let mut config = FloodgateConfig::default();
        config.ip_guard.capacity = 2;
        let app = build_router(AppState::from_config(&config).unwrap()).unwrap();

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request(Method::GET, "/healthz", None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app
            .clone()
            .oneshot(request(Method::GET, "/healthz", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_reclaimer_watches_all_state() {
        let config = FloodgateConfig::default();
        let state = AppState::from_config(&config).unwrap();
        let reclaimer = state.reclaimer(&config);
        assert_eq!(reclaimer.interval(), config.reclaimer.cleanup_interval());
        assert_eq!(reclaimer.sweep(), 0);
    }
}
