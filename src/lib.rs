//! Floodgate - In-Process Rate Limiting and Abuse Mitigation
//!
//! This crate implements admission control for HTTP services. Requests are
//! admitted against token buckets keyed per user and endpoint or per client
//! IP, and IPs that keep hammering an exhausted bucket are escalated to a
//! temporary block. All state is in memory and owned by explicitly
//! constructed limiter objects.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
