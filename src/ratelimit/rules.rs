//! Named rate limit rules.
//!
//! A rule bundles the parameters of one guarded operation (algorithm,
//! nominal rate, window, capacity) under a name, so call sites only have to
//! supply the resolved caller key.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::algorithm::Algorithm;
use crate::error::{LimiterError, Result};

/// Parameters for one guarded operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Rule name
    pub name: String,
    /// Algorithm; unknown names fall back to the token bucket
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Nominal permits per second
    #[serde(default = "default_permits_per_second")]
    pub permits_per_second: f64,
    /// Window size in seconds (window algorithms)
    #[serde(default = "default_window_size")]
    pub window_size: i64,
    /// Bucket capacity (token bucket); -1 derives it from the rate
    #[serde(default = "default_capacity")]
    pub capacity: i64,
}

fn default_permits_per_second() -> f64 {
    1.0
}

fn default_window_size() -> i64 {
    1
}

fn default_capacity() -> i64 {
    -1
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            name: String::new(),
            algorithm: Algorithm::default(),
            permits_per_second: default_permits_per_second(),
            window_size: default_window_size(),
            capacity: default_capacity(),
        }
    }
}

/// A set of rules looked up by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    rules: HashMap<String, RateLimitRule>,
}

#[derive(Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RateLimitRule>,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a rule set, rejecting duplicate or empty names.
    pub fn from_rules(rules: impl IntoIterator<Item = RateLimitRule>) -> Result<Self> {
        let mut set = Self::new();
        for rule in rules {
            set.insert(rule)?;
        }
        Ok(set)
    }

    /// Load rules from a YAML string.
    ///
    /// Accepts either a bare list of rules or a mapping with a `rules` list.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(rules) = serde_yaml::from_str::<Vec<RateLimitRule>>(yaml) {
            return Self::from_rules(rules);
        }

        let file: RuleFile = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        Self::from_rules(file.rules)
    }

    /// Add a rule.
    pub fn insert(&mut self, rule: RateLimitRule) -> Result<()> {
        if rule.name.is_empty() {
            return Err(LimiterError::Config("rate limit rule without a name".to_string()));
        }
        if self.rules.contains_key(&rule.name) {
            return Err(LimiterError::Config(format!(
                "duplicate rate limit rule: {}",
                rule.name
            )));
        }
        self.rules.insert(rule.name.clone(), rule);
        Ok(())
    }

    /// Find a rule by name.
    pub fn get(&self, name: &str) -> Option<&RateLimitRule> {
        self.rules.get(name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
