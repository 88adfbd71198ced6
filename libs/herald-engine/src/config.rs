use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use herald_api::{BusError, OverflowPolicy, WireTypeResolver};

use crate::retry::RetryPolicy;

// ═══════════════════════════════════════════════════════════════
//  Retry Config
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    /// Base backoff; retry n waits 2^n times this.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Retries after the first attempt.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.min_interval_ms), self.max_depth)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            max_depth: default_max_depth(),
        }
    }
}

fn default_min_interval_ms() -> u64 {
    100
}
fn default_max_depth() -> u32 {
    3
}

// ═══════════════════════════════════════════════════════════════
//  Wire type overrides
// ═══════════════════════════════════════════════════════════════

/// `type` is the simple Rust type name, `wire` the name used on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WireTypeAlias {
    #[serde(rename = "type")]
    pub type_name: String,
    pub wire: String,
}

// ═══════════════════════════════════════════════════════════════
//  Bus Config
// ═══════════════════════════════════════════════════════════════

/// ```toml
/// default_ttl_ms = 5000
/// subscription_buffer = 256
/// overflow = "back_pressure"
///
/// [retry]
/// min_interval_ms = 50
/// max_depth = 2
///
/// [[wire_types]]
/// type = "PlaceOrder"
/// wire = "orders.place"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    /// Buffer of each EventBus subscription.
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
    #[serde(default = "default_overflow")]
    pub overflow: OverflowPolicy,
    #[serde(default)]
    pub wire_types: Vec<WireTypeAlias>,
}

fn default_ttl_ms() -> u64 {
    herald_api::DEFAULT_TTL.as_millis() as u64
}
fn default_subscription_buffer() -> usize {
    1024
}
fn default_overflow() -> OverflowPolicy {
    OverflowPolicy::BackPressure
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            default_ttl_ms: default_ttl_ms(),
            subscription_buffer: default_subscription_buffer(),
            overflow: default_overflow(),
            wire_types: Vec::new(),
        }
    }
}

impl BusConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BusError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BusError::Configuration(format!("read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, BusError> {
        let config: Self = toml::from_str(text)
            .map_err(|e| BusError::Configuration(format!("parse bus config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if self.subscription_buffer == 0 {
            return Err(BusError::Configuration(
                "subscription_buffer must be at least 1".into(),
            ));
        }
        if self.default_ttl_ms == 0 {
            return Err(BusError::Configuration("default_ttl_ms must be positive".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for alias in &self.wire_types {
            if alias.type_name.is_empty() || alias.wire.is_empty() {
                return Err(BusError::Configuration(
                    "wire_types entries need both 'type' and 'wire'".into(),
                ));
            }
            if !seen.insert(alias.type_name.as_str()) {
                return Err(BusError::Configuration(format!(
                    "wire type of '{}' is overridden twice",
                    alias.type_name
                )));
            }
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// Resolver carrying every `[[wire_types]]` override.
    pub fn resolver(&self) -> WireTypeResolver {
        self.wire_types
            .iter()
            .fold(WireTypeResolver::new(), |resolver, alias| {
                resolver.alias(alias.type_name.clone(), alias.wire.clone())
            })
    }
}
