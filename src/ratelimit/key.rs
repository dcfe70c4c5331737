//! State key generation and handling.

use super::algorithm::Algorithm;

/// Default root segment shared by every state key.
pub const DEFAULT_ROOT: &str = "ratelimit";

/// A key that uniquely identifies one algorithm's state for one caller key.
///
/// Rendered as `<root>:<tag>:<caller key>`, e.g. `ratelimit:fw:user:42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    /// The algorithm owning this state
    pub algorithm: Algorithm,
    /// The fully qualified key in the store
    key: String,
}

impl StateKey {
    /// Create a state key under the default root.
    pub fn new(algorithm: Algorithm, caller_key: &str) -> Self {
        KeyNamespace::default().key(algorithm, caller_key)
    }

    /// The key as stored.
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// Builds state keys under a configurable root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    root: String,
}

impl KeyNamespace {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// The prefix every key of `algorithm` starts with.
    pub fn prefix(&self, algorithm: Algorithm) -> String {
        format!("{}:{}:", self.root, algorithm.tag())
    }

    /// Derive the state key for `caller_key` under `algorithm`.
    pub fn key(&self, algorithm: Algorithm, caller_key: &str) -> StateKey {
        StateKey {
            algorithm,
            key: format!("{}{}", self.prefix(algorithm), caller_key),
        }
    }
}

impl Default for KeyNamespace {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}
