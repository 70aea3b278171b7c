//! Refill rules and their configuration.
//!
//! Each protected operation class gets one immutable [`RefillRule`]. Rules are
//! declared in configuration as a capacity, a refill amount and a refill period
//! expressed in whole time units.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::RateLimitingConfig;
use crate::error::{Result, TokenhiveError};

/// Time unit for refill periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A refill rule as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Maximum tokens a bucket can hold
    pub capacity: u64,
    /// Tokens added per refill period
    pub refill_amount: u64,
    /// Number of `unit`s per refill period
    #[serde(default = "default_refill_period")]
    pub refill_period: u64,
    #[serde(default = "default_unit")]
    pub unit: TimeUnit,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_amount: 5,
            refill_period: default_refill_period(),
            unit: default_unit(),
        }
    }
}

fn default_refill_period() -> u64 {
    1
}

fn default_unit() -> TimeUnit {
    TimeUnit::Minute
}

impl RuleConfig {
    /// Validate and convert into a [`RefillRule`].
    pub fn to_rule(&self) -> Result<RefillRule> {
        let period = self
            .unit
            .duration()
            .checked_mul(u32::try_from(self.refill_period).unwrap_or(u32::MAX))
            .ok_or_else(|| TokenhiveError::Config("refill_period overflows".to_string()))?;
        RefillRule::new(self.capacity, self.refill_amount, period)
    }
}

/// Greedy refill configuration for one operation class.
///
/// Tokens trickle in proportionally to elapsed time at
/// `refill_amount / refill_period`, capped at `capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefillRule {
    pub capacity: u64,
    pub refill_amount: u64,
    pub refill_period: Duration,
}

impl RefillRule {
    pub fn new(capacity: u64, refill_amount: u64, refill_period: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(TokenhiveError::Config(
                "capacity must be greater than zero".to_string(),
            ));
        }
        if refill_amount == 0 {
            return Err(TokenhiveError::Config(
                "refill_amount must be greater than zero".to_string(),
            ));
        }
        if refill_period.is_zero() || refill_period.as_nanos() > u128::from(u64::MAX) {
            return Err(TokenhiveError::Config(
                "refill_period must be positive and below 584 years".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            refill_amount,
            refill_period,
        })
    }

    /// Refill periods needed to go from empty to full.
    pub fn cycles_to_full(&self) -> u64 {
        self.capacity.div_ceil(self.refill_amount)
    }

    /// Time for an empty bucket to refill completely.
    pub fn time_to_full(&self) -> Duration {
        self.refill_period
            .checked_mul(u32::try_from(self.cycles_to_full()).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX)
    }
}

/// The default rule plus per-operation overrides.
#[derive(Debug, Clone)]
pub struct RuleSet {
    default_rule: RefillRule,
    operations: HashMap<String, RefillRule>,
}

impl RuleSet {
    /// A rule set in which every operation uses `default_rule`.
    pub fn uniform(default_rule: RefillRule) -> Self {
        Self {
            default_rule,
            operations: HashMap::new(),
        }
    }

    /// Add or replace the rule for one operation.
    pub fn with_operation(mut self, operation: &str, rule: RefillRule) -> Self {
        self.operations.insert(operation.to_string(), rule);
        self
    }

    /// Build from the rate limiting section of the configuration.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let default_rule = config.default_rule.to_rule()?;
        let mut operations = HashMap::with_capacity(config.operations.len());
        for (name, rule) in &config.operations {
            let rule = rule
                .to_rule()
                .map_err(|e| TokenhiveError::Config(format!("operation {}: {}", name, e)))?;
            operations.insert(name.clone(), rule);
        }
        Ok(Self {
            default_rule,
            operations,
        })
    }

    /// Parse the rate limiting section from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateLimitingConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TokenhiveError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        Self::from_config(&config)
    }

    /// Rule for `operation`, falling back to the default rule.
    pub fn rule_for(&self, operation: &str) -> RefillRule {
        self.operations
            .get(operation)
            .copied()
            .unwrap_or(self.default_rule)
    }

    pub fn default_rule(&self) -> RefillRule {
        self.default_rule
    }

    /// Longest time any configured bucket needs to refill from empty.
    pub fn longest_time_to_full(&self) -> Duration {
        self.operations
            .values()
            .map(RefillRule::time_to_full)
            .fold(self.default_rule.time_to_full(), Duration::max)
    }
}
