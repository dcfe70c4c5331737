//! In-process atomic executor.
//!
//! Mirrors the built-in Lua programs natively against a small keyed store
//! with Redis-like value types and key expiry. Every execution holds one
//! lock for its whole read-modify-write, which gives the same per-key
//! indivisibility Redis gives a script.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::algorithm::Algorithm;
use super::clock::{Clock, SystemClock};
use super::executor::AtomicExecutor;
use super::key::StateKey;
use super::scripts::Program;
use crate::error::{LimiterError, Result};

/// A stored value.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    /// Plain integer string
    Counter(i64),
    /// Sorted set, member -> score
    SortedSet(BTreeMap<String, i64>),
    /// Token bucket hash
    Bucket { tokens: f64, timestamp: i64 },
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Counter(_) => "string",
            Value::SortedSet(_) => "zset",
            Value::Bucket { .. } => "hash",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Store-clock millisecond at which the key disappears
    expires_at: Option<i64>,
}

/// An in-memory stand-in for the Redis backing store.
///
/// Program text is ignored; the executor runs its own rendition of the
/// built-in program for [`Program::algorithm`], so a limiter refuses to pair
/// it with override scripts. Key expiry is measured against the
/// executor's own clock, the way Redis measures TTL against the server
/// clock.
pub struct MemoryExecutor {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryExecutor {
    /// Create an executor whose key expiry follows the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an executor whose key expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Current fixed-window counter at `key`, if live.
    pub fn counter(&self, key: &StateKey) -> Option<i64> {
        match self.live_value(key)? {
            Value::Counter(count) => Some(count),
            _ => None,
        }
    }

    /// Number of sliding-window entries at `key`, if live.
    pub fn window_len(&self, key: &StateKey) -> Option<usize> {
        match self.live_value(key)? {
            Value::SortedSet(set) => Some(set.len()),
            _ => None,
        }
    }

    /// Stored `(tokens, timestamp)` of the bucket at `key`, if live.
    pub fn bucket(&self, key: &StateKey) -> Option<(f64, i64)> {
        match self.live_value(key)? {
            Value::Bucket { tokens, timestamp } => Some((tokens, timestamp)),
            _ => None,
        }
    }

    /// Remaining time to live of `key` in milliseconds.
    pub fn ttl_millis(&self, key: &StateKey) -> Option<i64> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        let entry = live_entry(&mut entries, key.as_str(), now)?;
        entry.expires_at.map(|at| at - now)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !is_expired(entry, now));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every key.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn live_value(&self, key: &StateKey) -> Option<Value> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        live_entry(&mut entries, key.as_str(), now).map(|entry| entry.value.clone())
    }
}

impl Default for MemoryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryExecutor")
            .field("keys", &self.entries.lock().len())
            .finish()
    }
}

#[async_trait]
impl AtomicExecutor for MemoryExecutor {
    async fn execute(&self, program: &Program, key: &StateKey, args: &[i64]) -> Result<i64> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();

        let reply = match program.algorithm {
            Algorithm::FixedWindow => {
                let [limit, expire_secs] = positional(program, args)?;
                fixed_window(&mut entries, key.as_str(), now, limit, expire_secs)?
            }
            Algorithm::SlidingWindow => {
                let [limit, window_ms, request_ms] = positional(program, args)?;
                sliding_window(&mut entries, key.as_str(), now, limit, window_ms, request_ms)?
            }
            Algorithm::TokenBucket => {
                let [rate, capacity, request_ms, requested] = positional(program, args)?;
                token_bucket(&mut entries, key.as_str(), now, rate, capacity, request_ms, requested)?
            }
        };

        trace!(key = %key, algorithm = %program.algorithm, reply, "Executed in-memory program");
        Ok(reply)
    }

    fn runs_program_text(&self) -> bool {
        false
    }
}

fn positional<const N: usize>(program: &Program, args: &[i64]) -> Result<[i64; N]> {
    args.try_into().map_err(|_| {
        LimiterError::UnexpectedReply(format!(
            "{} program expects {} arguments, got {}",
            program.algorithm,
            N,
            args.len()
        ))
    })
}

fn is_expired(entry: &Entry, now: i64) -> bool {
    entry.expires_at.is_some_and(|at| at <= now)
}

fn live_entry<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: i64,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| is_expired(entry, now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn wrong_type(key: &str, found: &Value) -> LimiterError {
    LimiterError::UnexpectedReply(format!(
        "WRONGTYPE key {} holds a {} value",
        key,
        found.type_name()
    ))
}

/// `EXPIRE key secs`: a non-positive TTL deletes the key.
fn expire(entries: &mut HashMap<String, Entry>, key: &str, now: i64, secs: i64) {
    if secs <= 0 {
        entries.remove(key);
    } else if let Some(entry) = entries.get_mut(key) {
        entry.expires_at = Some(now.saturating_add(secs.saturating_mul(1000)));
    }
}

fn fixed_window(
    entries: &mut HashMap<String, Entry>,
    key: &str,
    now: i64,
    limit: i64,
    expire_secs: i64,
) -> Result<i64> {
    let current = match live_entry(entries, key, now) {
        None => 0,
        Some(Entry {
            value: Value::Counter(count),
            ..
        }) => *count,
        Some(other) => return Err(wrong_type(key, &other.value)),
    };

    if current + 1 > limit {
        return Ok(0);
    }

    let entry = entries.entry(key.to_string()).or_insert(Entry {
        value: Value::Counter(0),
        expires_at: None,
    });
    entry.value = Value::Counter(current + 1);
    expire(entries, key, now, expire_secs);
    Ok(1)
}

fn sliding_window(
    entries: &mut HashMap<String, Entry>,
    key: &str,
    now: i64,
    limit: i64,
    window_ms: i64,
    request_ms: i64,
) -> Result<i64> {
    let cutoff = request_ms.saturating_sub(window_ms);

    let count = match live_entry(entries, key, now) {
        None => 0,
        Some(entry) => match &mut entry.value {
            Value::SortedSet(set) => {
                set.retain(|_, score| *score < 0 || *score >= cutoff);
                set.len() as i64
            }
            other => return Err(wrong_type(key, other)),
        },
    };
    if count == 0 {
        // Redis drops a sorted set once its last member is removed.
        entries.remove(key);
    }

    if count >= limit {
        return Ok(0);
    }

    let entry = entries.entry(key.to_string()).or_insert(Entry {
        value: Value::SortedSet(BTreeMap::new()),
        expires_at: None,
    });
    if let Value::SortedSet(set) = &mut entry.value {
        let same_ms = set.values().filter(|score| **score == request_ms).count();
        let member = if same_ms == 0 {
            request_ms.to_string()
        } else {
            format!("{}-{}", request_ms, same_ms)
        };
        set.insert(member, request_ms);
    }
    let ttl_secs = (window_ms as f64 / 1000.0).ceil() as i64;
    expire(entries, key, now, ttl_secs);
    Ok(1)
}

fn token_bucket(
    entries: &mut HashMap<String, Entry>,
    key: &str,
    now: i64,
    rate: i64,
    capacity: i64,
    request_ms: i64,
    requested: i64,
) -> Result<i64> {
    let (last_tokens, last_refreshed) = match live_entry(entries, key, now) {
        None => (capacity as f64, request_ms),
        Some(Entry {
            value: Value::Bucket { tokens, timestamp },
            ..
        }) => (*tokens, *timestamp),
        Some(other) => return Err(wrong_type(key, &other.value)),
    };

    let elapsed = request_ms.saturating_sub(last_refreshed).max(0) as f64 / 1000.0;
    let filled = (capacity as f64).min(last_tokens + elapsed * rate as f64);
    let allowed = filled >= requested as f64;
    let tokens = if allowed {
        filled - requested as f64
    } else {
        filled
    };

    let entry = entries.entry(key.to_string()).or_insert(Entry {
        value: Value::Bucket {
            tokens,
            timestamp: request_ms,
        },
        expires_at: None,
    });
    entry.value = Value::Bucket {
        tokens,
        timestamp: request_ms,
    };

    Ok(if allowed { 1 } else { 0 })
}
