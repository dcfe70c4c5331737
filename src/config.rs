//! Configuration management for Quorate.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LimiterError, Result};
use crate::ratelimit::{KeyNamespace, RateLimitRule, RuleSet, ScriptSource, DEFAULT_ROOT};

/// Prefix for environment overrides, e.g. `QUORATE_REDIS__URL`.
pub const ENV_PREFIX: &str = "QUORATE";

/// Main configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Backing store connection
    #[serde(default)]
    pub redis: RedisConfig,

    /// Where algorithm programs are loaded from
    #[serde(default)]
    pub scripts: ScriptsConfig,

    /// State key layout
    #[serde(default)]
    pub namespace: NamespaceConfig,

    /// Named rules
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Per-call response timeout in milliseconds; unset waits indefinitely
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,

    /// Connection setup timeout in milliseconds; `null` waits indefinitely
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: Option<u64>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            response_timeout_ms: None,
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout_ms.map(Duration::from_millis)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connection_timeout_ms() -> Option<u64> {
    Some(5_000)
}

/// Script loading configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptsConfig {
    /// Directory holding `fixed_window.lua`, `sliding_window.lua` and
    /// `token_bucket.lua`; the built-in programs are used when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl ScriptsConfig {
    pub fn source(&self) -> ScriptSource {
        match &self.dir {
            Some(dir) => ScriptSource::Directory(dir.clone()),
            None => ScriptSource::Builtin,
        }
    }
}

/// State key namespace configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Root segment of every state key
    #[serde(default = "default_root")]
    pub root: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

impl NamespaceConfig {
    pub fn key_namespace(&self) -> KeyNamespace {
        KeyNamespace::new(self.root.clone())
    }
}

fn default_root() -> String {
    DEFAULT_ROOT.to_string()
}

impl LimiterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// Load configuration from an optional file, then apply environment
    /// overrides (`QUORATE_REDIS__URL`, `QUORATE_NAMESPACE__ROOT`, ...).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// The configured rules, indexed by name.
    pub fn rule_set(&self) -> Result<RuleSet> {
        RuleSet::from_rules(self.rules.iter().cloned())
    }
}
