//! Bucket policies and named policy tables.
//!
//! A policy fixes the capacity and refill rate of every bucket created under
//! it. Policies are immutable once a limiter is built; there is no runtime
//! reconfiguration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};

/// Time unit for refill rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// Number of tokens added to a bucket per unit of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefillRate {
    /// Tokens added per unit
    pub tokens: u64,
    /// The time unit
    pub unit: TimeUnit,
}

impl RefillRate {
    pub fn new(tokens: u64, unit: TimeUnit) -> Self {
        Self { tokens, unit }
    }

    /// A rate of `tokens` per second.
    pub fn per_second(tokens: u64) -> Self {
        Self::new(tokens, TimeUnit::Second)
    }
}

/// Capacity and refill rate for the buckets of one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketPolicy {
    /// Maximum tokens a bucket holds; also the burst size
    pub capacity: u64,
    /// How fast tokens come back
    pub refill: RefillRate,
}

impl BucketPolicy {
    /// Create a validated policy.
    pub fn new(capacity: u64, refill: RefillRate) -> Result<Self> {
        let policy = Self { capacity, refill };
        policy.validate()?;
        Ok(policy)
    }

    /// Reject policies that would deny every request.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(FloodgateError::Config(
                "bucket capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Checkout: 5 tokens, 1 per second.
    pub fn checkout() -> Self {
        Self {
            capacity: 5,
            refill: RefillRate::per_second(1),
        }
    }

    /// Subscription management: 10 tokens, 1 per second.
    pub fn subscription() -> Self {
        Self {
            capacity: 10,
            refill: RefillRate::per_second(1),
        }
    }

    /// Webhook intake: 100 tokens, 10 per second.
    pub fn webhook() -> Self {
        Self {
            capacity: 100,
            refill: RefillRate::per_second(10),
        }
    }

    /// Customer portal: 3 tokens, 1 per second.
    pub fn portal() -> Self {
        Self {
            capacity: 3,
            refill: RefillRate::per_second(1),
        }
    }
}

/// Named per-endpoint policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyTable {
    policies: HashMap<String, BucketPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PolicyTable {
    /// Create an empty table.
    pub fn empty() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }

    /// The built-in endpoint policies.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        table.insert("checkout", BucketPolicy::checkout());
        table.insert("subscription", BucketPolicy::subscription());
        table.insert("webhook", BucketPolicy::webhook());
        table.insert("portal", BucketPolicy::portal());
        table
    }

    /// Load a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading endpoint policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a table from a YAML mapping of name to policy.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: PolicyTable = serde_yaml::from_str(yaml).map_err(|e| {
            FloodgateError::Config(format!("Failed to parse endpoint policies: {}", e))
        })?;
        table.validate()?;
        Ok(table)
    }

    /// Validate every policy in the table.
    pub fn validate(&self) -> Result<()> {
        for (name, policy) in &self.policies {
            policy
                .validate()
                .map_err(|e| e.in_context(&format!("policy '{}'", name)))?;
        }
        Ok(())
    }

    pub fn insert(&mut self, name: impl Into<String>, policy: BucketPolicy) {
        self.policies.insert(name.into(), policy);
    }

    /// Get the policy for an endpoint.
    pub fn get(&self, name: &str) -> Option<&BucketPolicy> {
        self.policies.get(name)
    }

    /// Get the policy for an endpoint, or a configuration error naming it.
    pub fn require(&self, name: &str) -> Result<BucketPolicy> {
        self.get(name)
            .copied()
            .ok_or_else(|| FloodgateError::Config(format!("no policy named '{}'", name)))
    }

    /// Overlay `other` onto this table; entries in `other` win.
    pub fn merge(&mut self, other: PolicyTable) {
        self.policies.extend(other.policies);
    }

    /// Fill in built-in policies the table does not define.
    pub fn with_builtin_defaults(mut self) -> Self {
        for (name, policy) in Self::builtin().policies {
            self.policies.entry(name).or_insert(policy);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
