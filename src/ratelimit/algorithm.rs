//! Admission-control algorithms and their numeric parameter rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::LimiterError;

/// The admission-control algorithm backing a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Hard-reset counter per window
    FixedWindow,
    /// Count of timestamped requests in a moving window
    SlidingWindow,
    /// Capacity-bounded pool refilled at a constant rate
    ///
    /// Also the fallback for names that do not parse.
    #[default]
    TokenBucket,
}

impl Algorithm {
    /// All algorithms, in declaration order.
    pub const ALL: [Algorithm; 3] = [
        Algorithm::FixedWindow,
        Algorithm::SlidingWindow,
        Algorithm::TokenBucket,
    ];

    /// The namespace tag used in state keys.
    pub fn tag(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fw",
            Algorithm::SlidingWindow => "sw",
            Algorithm::TokenBucket => "tb",
        }
    }

    /// Canonical snake_case name.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
        }
    }

    /// Parse an algorithm name, falling back to [`Algorithm::TokenBucket`]
    /// when the name is not recognised.
    pub fn parse_lenient(name: &str) -> Self {
        match name.parse() {
            Ok(algorithm) => algorithm,
            Err(_) => {
                warn!(
                    name = %name,
                    fallback = %Algorithm::default(),
                    "Unrecognised rate limit algorithm, using fallback"
                );
                Algorithm::default()
            }
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = LimiterError;

    /// Accepts `fixed_window`, `FIXED_WINDOW`, `fixed-window` and the short tags.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "fixed_window" | "fw" => Ok(Algorithm::FixedWindow),
            "sliding_window" | "sw" => Ok(Algorithm::SlidingWindow),
            "token_bucket" | "tb" => Ok(Algorithm::TokenBucket),
            _ => Err(LimiterError::Config(format!(
                "unknown rate limit algorithm: {}",
                s
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for Algorithm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(Algorithm::parse_lenient(&name))
    }
}

/// Integer limit (or refill rate) for a nominal permits-per-second value.
///
/// Always rounds up: 2.1 permits per second becomes a limit of 3.
pub fn limit_for(permits_per_second: f64) -> i64 {
    permits_per_second.ceil() as i64
}

/// Token-bucket capacity for a caller-supplied capacity.
///
/// A positive capacity is used as is. Otherwise it is twice the *un-ceiled*
/// rate, rounded to nearest and never below 1.
pub fn capacity_for(permits_per_second: f64, capacity: i64) -> i64 {
    if capacity > 0 {
        capacity
    } else {
        ((permits_per_second * 2.0).round() as i64).max(1)
    }
}
