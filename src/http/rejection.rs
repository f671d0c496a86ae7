//! HTTP responses for denied requests.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Bucket capacity applied to the request.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Tokens left in the bucket after the request.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// The quota state reported to a client alongside a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
}

impl Quota {
    /// Set the `X-RateLimit-*` headers unless an inner limiter already did.
    ///
    /// Limiters nest outermost-last on the way out, so the most specific quota
    /// is the one a client sees.
    pub fn apply(&self, headers: &mut HeaderMap) {
        if headers.contains_key(&X_RATELIMIT_LIMIT) {
            return;
        }
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
    }
}

/// Status code used when a blocked IP is turned away.
///
/// Blocks have historically been answered with both 429 and 403 depending on
/// the call site. The two are kept as distinct, selectable outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockResponse {
    /// 429 Too Many Requests
    #[default]
    TooManyRequests,
    /// 403 Forbidden
    Forbidden,
}

impl BlockResponse {
    pub fn status(&self) -> StatusCode {
        match self {
            BlockResponse::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            BlockResponse::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

/// A request turned away by a limiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// A keyed (per user and endpoint) bucket was empty.
    #[error("Rate limit exceeded")]
    RateLimitExceeded {
        limit: u64,
        retry_after: Option<Duration>,
    },

    /// The client IP's bucket was empty.
    #[error("Too many requests")]
    TooManyRequests {
        limit: u64,
        retry_after: Option<Duration>,
    },

    /// The client IP is serving a temporary block.
    #[error("IP temporarily blocked due to excessive requests")]
    IpBlocked {
        limit: u64,
        retry_after: Option<Duration>,
        response: BlockResponse,
    },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl Rejection {
    /// The HTTP status for this rejection.
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::RateLimitExceeded { .. } | Rejection::TooManyRequests { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Rejection::IpBlocked { response, .. } => response.status(),
        }
    }

    /// Suggested wait before retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Rejection::RateLimitExceeded { retry_after, .. }
            | Rejection::TooManyRequests { retry_after, .. }
            | Rejection::IpBlocked { retry_after, .. } => *retry_after,
        }
    }

    /// Quota state at the time of the rejection; nothing is left.
    pub fn quota(&self) -> Quota {
        let limit = match self {
            Rejection::RateLimitExceeded { limit, .. }
            | Rejection::TooManyRequests { limit, .. }
            | Rejection::IpBlocked { limit, .. } => *limit,
        };
        Quota {
            limit,
            remaining: 0,
        }
    }
}

/// Whole seconds for a `Retry-After` header, rounded up and never below one.
pub fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = self.retry_after();
        let quota = self.quota();
        let body = Json(ErrorBody {
            error: self.to_string(),
        });

        let mut response = (status, body).into_response();
        quota.apply(response.headers_mut());
        if let Some(wait) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(wait)));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(200)), 1);
        assert_eq!(retry_after_secs(Duration::from_secs(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(900)), 900);
    }

    #[tokio::test]
    async fn test_rate_limit_exceeded_response() {
        let response = Rejection::RateLimitExceeded {
            limit: 5,
            retry_after: Some(Duration::from_millis(600)),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "5");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "error": "Rate limit exceeded" })
        );
    }

    #[tokio::test]
    async fn test_blocked_response_status_is_configurable() {
        let blocked = |response| Rejection::IpBlocked {
            limit: 20,
            retry_after: Some(Duration::from_secs(900)),
            response,
        };

        let response = blocked(BlockResponse::TooManyRequests).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "900");

        let response = blocked(BlockResponse::Forbidden).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "error": "IP temporarily blocked due to excessive requests" })
        );
    }

    #[test]
    fn test_no_retry_after_without_refill() {
        let response = Rejection::TooManyRequests {
            limit: 1,
            retry_after: None,
        }
        .into_response();
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "1");
    }

    #[test]
    fn test_quota_keeps_inner_headers() {
        let mut headers = HeaderMap::new();
        Quota {
            limit: 3,
            remaining: 2,
        }
        .apply(&mut headers);
        Quota {
            limit: 20,
            remaining: 19,
        }
        .apply(&mut headers);

        assert_eq!(headers[X_RATELIMIT_LIMIT], "3");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "2");
    }
}
