//! Configuration management for Floodgate.
//!
//! Limits are fixed when limiters are constructed; nothing here is re-read at
//! runtime.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::http::BlockResponse;
use crate::ratelimit::{
    BucketPolicy, IpGuardSettings, PolicyTable, RefillRate, DEFAULT_VIOLATION_THRESHOLD,
    MAX_BLOCK_DURATION, MAX_CLEANUP_INTERVAL,
};

/// Prefix for environment overrides, e.g. `FLOODGATE__SERVER__HTTP_ADDR`.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global per-IP limiter configuration
    #[serde(default)]
    pub ip_guard: IpGuardConfig,

    /// Background sweep configuration
    #[serde(default)]
    pub reclaimer: ReclaimerConfig,

    /// Per-endpoint bucket policies, keyed by endpoint name
    #[serde(default)]
    pub policies: PolicyTable,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Header carrying the authenticated user id, when a trusted gateway sets one.
    /// Without it the user id is read from request extensions.
    #[serde(default)]
    pub identity_header: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            identity_header: None,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Global per-IP limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpGuardConfig {
    /// Whether the per-IP limiter is installed at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Burst size per IP
    #[serde(default = "default_ip_capacity")]
    pub capacity: u64,

    /// Refill rate per IP
    #[serde(default = "default_ip_refill")]
    pub refill: RefillRate,

    /// Consecutive denials tolerated before blocking
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,

    /// Block length in seconds
    #[serde(default = "default_block_duration")]
    pub block_duration_secs: u64,

    /// Seconds of inactivity after which a visitor is forgotten
    #[serde(default = "default_idle_eviction")]
    pub idle_eviction_secs: u64,

    /// Status returned to blocked IPs
    #[serde(default)]
    pub block_response: BlockResponse,
}

impl Default for IpGuardConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            capacity: default_ip_capacity(),
            refill: default_ip_refill(),
            violation_threshold: default_violation_threshold(),
            block_duration_secs: default_block_duration(),
            idle_eviction_secs: default_idle_eviction(),
            block_response: BlockResponse::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_ip_capacity() -> u64 {
    20
}

fn default_ip_refill() -> RefillRate {
    RefillRate::per_second(10)
}

fn default_violation_threshold() -> u32 {
    DEFAULT_VIOLATION_THRESHOLD
}

fn default_block_duration() -> u64 {
    15 * 60
}

fn default_idle_eviction() -> u64 {
    5 * 60
}

impl IpGuardConfig {
    /// Build validated guard settings.
    pub fn settings(&self) -> Result<IpGuardSettings> {
        let policy =
            BucketPolicy::new(self.capacity, self.refill).map_err(|e| e.in_context("ip_guard"))?;
        if self.violation_threshold == 0 {
            return Err(FloodgateError::Config(
                "ip_guard: violation_threshold must be greater than zero".to_string(),
            ));
        }
        if self.block_duration_secs == 0 {
            return Err(FloodgateError::Config(
                "ip_guard: block_duration_secs must be greater than zero".to_string(),
            ));
        }
        if self.block_duration_secs > MAX_BLOCK_DURATION.as_secs() {
            return Err(FloodgateError::Config(format!(
                "ip_guard: block_duration_secs must be at most {}",
                MAX_BLOCK_DURATION.as_secs()
            )));
        }
        Ok(IpGuardSettings {
            policy,
            violation_threshold: self.violation_threshold,
            block_duration: Duration::from_secs(self.block_duration_secs),
            idle_eviction: Duration::from_secs(self.idle_eviction_secs),
        })
    }
}

/// Background sweep configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReclaimerConfig {
    /// Seconds between sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Seconds of inactivity after which a keyed bucket is evicted
    #[serde(default = "default_idle_eviction")]
    pub bucket_idle_eviction_secs: u64,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval(),
            bucket_idle_eviction_secs: default_idle_eviction(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    60
}

impl ReclaimerConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn bucket_idle_eviction(&self) -> Duration {
        Duration::from_secs(self.bucket_idle_eviction_secs)
    }
}

impl FloodgateConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.finish()
    }

    /// Load configuration from an optional file layered under environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: FloodgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.finish()
    }

    /// Overlay endpoint policies from a separate YAML file.
    pub fn with_policies_file(mut self, path: &Path) -> Result<Self> {
        let table = PolicyTable::from_file(path).map_err(|e| e.in_context("policies file"))?;
        self.policies.merge(table);
        self.validate()?;
        Ok(self)
    }

    /// Fill in built-in policies and validate.
    fn finish(mut self) -> Result<Self> {
        self.policies = self.policies.with_builtin_defaults();
        self.validate()?;
        Ok(self)
    }

    /// Reject configurations that cannot produce working limiters.
    pub fn validate(&self) -> Result<()> {
        self.policies.validate()?;
        if self.ip_guard.enabled {
            self.ip_guard.settings()?;
        }
        if self.reclaimer.cleanup_interval_secs == 0 {
            return Err(FloodgateError::Config(
                "reclaimer: cleanup_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.reclaimer.cleanup_interval_secs > MAX_CLEANUP_INTERVAL.as_secs() {
            return Err(FloodgateError::Config(format!(
                "reclaimer: cleanup_interval_secs must be at most {}",
                MAX_CLEANUP_INTERVAL.as_secs()
            )));
        }
        Ok(())
    }
}
