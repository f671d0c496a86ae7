//! HTTP surface: admission middleware, rejections and the server.

mod middleware;
mod rejection;
mod router;
mod server;

pub use middleware::{ip_rate_limit, keyed_rate_limit, IpLimiter, KeyedLimiter};
pub use rejection::{
    retry_after_secs, BlockResponse, Quota, Rejection, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
};
pub use router::{build_router, AppState};
pub use server::HttpServer;
