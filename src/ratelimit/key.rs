//! Admission key derivation.
//!
//! A key strategy maps an inbound request to the string a limiter buckets on.
//! Identity and client address are consumed as opaque inputs; nothing here
//! authenticates anyone.

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::KeyResolutionError;

/// Header consulted first when resolving the client address.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// An authenticated user identifier, as supplied by the authentication layer.
///
/// Treated as an opaque string and never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves the authenticated user behind a request.
pub trait IdentityResolver: Send + Sync {
    fn user_id(&self, req: &Request) -> Result<UserId, KeyResolutionError>;
}

/// Reads a `UserId` that an upstream auth middleware stored in request extensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionIdentity;

impl IdentityResolver for ExtensionIdentity {
    fn user_id(&self, req: &Request) -> Result<UserId, KeyResolutionError> {
        req.extensions()
            .get::<UserId>()
            .cloned()
            .ok_or(KeyResolutionError::MissingIdentity)
    }
}

/// Reads the user id from a header set by a trusted gateway.
#[derive(Debug, Clone)]
pub struct HeaderIdentity {
    header: String,
}

impl HeaderIdentity {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into().to_ascii_lowercase(),
        }
    }
}

impl IdentityResolver for HeaderIdentity {
    fn user_id(&self, req: &Request) -> Result<UserId, KeyResolutionError> {
        let value = req
            .headers()
            .get(self.header.as_str())
            .ok_or(KeyResolutionError::MissingIdentity)?;
        let value = value
            .to_str()
            .map_err(|e| KeyResolutionError::InvalidIdentity(e.to_string()))?
            .trim();
        if value.is_empty() {
            return Err(KeyResolutionError::MissingIdentity);
        }
        Ok(UserId(value.to_string()))
    }
}

/// Derives the admission key for a request.
pub trait KeyStrategy: Send + Sync {
    fn derive_key(&self, req: &Request) -> Result<String, KeyResolutionError>;
}

/// Keys requests by authenticated user and endpoint name.
#[derive(Clone)]
pub struct UserEndpointKey {
    endpoint: String,
    identity: Arc<dyn IdentityResolver>,
}

impl UserEndpointKey {
    pub fn new(endpoint: impl Into<String>, identity: Arc<dyn IdentityResolver>) -> Self {
        Self {
            endpoint: endpoint.into(),
            identity,
        }
    }

    /// The endpoint name baked into every key.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Format the key for a user on this endpoint.
    pub fn key_for(&self, user: &UserId) -> String {
        format!("user:{}:endpoint:{}", user, self.endpoint)
    }
}

impl fmt::Debug for UserEndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserEndpointKey")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl KeyStrategy for UserEndpointKey {
    fn derive_key(&self, req: &Request) -> Result<String, KeyResolutionError> {
        let user = self.identity.user_id(req)?;
        Ok(self.key_for(&user))
    }
}

/// Keys requests by bare client IP.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIpKey;

impl KeyStrategy for ClientIpKey {
    fn derive_key(&self, req: &Request) -> Result<String, KeyResolutionError> {
        let remote = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.to_string());
        client_ip(req.headers(), remote.as_deref()).ok_or(KeyResolutionError::MissingClientAddress)
    }
}

/// Resolve the client IP for a request.
///
/// The first entry of `X-Forwarded-For` wins when present; otherwise the
/// transport remote address is used with its port stripped.
pub fn client_ip(headers: &HeaderMap, remote_addr: Option<&str>) -> Option<String> {
    let forwarded = headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty());

    if let Some(first) = forwarded {
        return Some(first.to_string());
    }

    remote_addr
        .map(strip_port)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

/// Strip the port from `host:port`, `[v6]:port`, or return a bare address unchanged.
pub fn strip_port(addr: &str) -> &str {
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return match socket {
            SocketAddr::V4(_) => addr.rsplit_once(':').map_or(addr, |(host, _)| host),
            SocketAddr::V6(_) => addr
                .rsplit_once("]:")
                .map_or(addr, |(host, _)| host.trim_start_matches('[')),
        };
    }

    // Bare IPv6 has several colons and no brackets; leave it alone
    if addr.matches(':').count() == 1 {
        return addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    }
    addr.trim_start_matches('[').trim_end_matches(']')
}
