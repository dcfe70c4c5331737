//! Core rate limiter implementation.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::algorithm::{capacity_for, limit_for, Algorithm};
use super::clock::{Clock, SystemClock};
use super::executor::AtomicExecutor;
use super::key::KeyNamespace;
use super::rules::RateLimitRule;
use super::scripts::{Program, ScriptRepository, ScriptSource};
use crate::config::LimiterConfig;
use crate::error::{LimiterError, Result};

/// Tokens taken by a single decision.
const REQUESTED_TOKENS: i64 = 1;

/// Reply an algorithm program sends back to admit a request.
const ADMIT: i64 = 1;

/// The rate limiting decision engine.
///
/// Holds no rate-limit state of its own: every decision is one atomic
/// program run against the store behind `E`. The only thing cached here is
/// program text, loaded when the limiter is built.
pub struct RateLimiter<E> {
    /// The store the programs run against
    executor: E,
    fixed_window: Program,
    sliding_window: Program,
    token_bucket: Program,
    /// State key builder
    namespace: KeyNamespace,
    /// Caller-side clock for request timestamps
    clock: Arc<dyn Clock>,
}

impl<E: AtomicExecutor> RateLimiter<E> {
    /// Create a rate limiter timestamping requests with the system clock.
    ///
    /// Loads all three programs up front, so a missing program fails here
    /// rather than on the first request.
    pub fn new(executor: E, scripts: ScriptRepository) -> Result<Self> {
        Self::with_clock(executor, scripts, Arc::new(SystemClock))
    }

    /// Create a rate limiter with the script source and key namespace taken
    /// from `config`.
    pub fn from_config(executor: E, config: &LimiterConfig) -> Result<Self> {
        let scripts = ScriptRepository::new(config.scripts.source());
        Ok(Self::new(executor, scripts)?.with_namespace(config.namespace.key_namespace()))
    }

    /// Create a rate limiter timestamping requests with `clock`.
    pub fn with_clock(
        executor: E,
        scripts: ScriptRepository,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        scripts.preload()?;
        if !executor.runs_program_text() && *scripts.source() != ScriptSource::Builtin {
            return Err(LimiterError::Config(
                "executor only runs the built-in programs; unset scripts.dir".to_string(),
            ));
        }

        Ok(Self {
            fixed_window: scripts.program(Algorithm::FixedWindow)?,
            sliding_window: scripts.program(Algorithm::SlidingWindow)?,
            token_bucket: scripts.program(Algorithm::TokenBucket)?,
            executor,
            namespace: KeyNamespace::default(),
            clock,
        })
    }

    /// Place state keys under a different root.
    pub fn with_namespace(mut self, namespace: KeyNamespace) -> Self {
        self.namespace = namespace;
        self
    }

    /// Decide whether one request for `key` may proceed.
    ///
    /// Returns `Ok(false)` for a normal rejection. Store faults and
    /// timeouts come back as errors; they are never turned into a decision.
    ///
    /// * `permits_per_second` is rounded up to an integer limit (fixed and
    ///   sliding window) or refill rate (token bucket).
    /// * `window_size_secs` applies to the window algorithms.
    /// * `capacity` applies to the token bucket; `-1` (or any non-positive
    ///   value) means twice `permits_per_second`, rounded, at least 1.
    ///
    /// Arguments are passed through unvalidated: a zero limit rejects every
    /// request and a zero window ages every entry out at once.
    pub async fn try_acquire(
        &self,
        key: &str,
        algorithm: Algorithm,
        permits_per_second: f64,
        window_size_secs: i64,
        capacity: i64,
    ) -> Result<bool> {
        let state_key = self.namespace.key(algorithm, key);
        let now = self.clock.now_millis();
        let args = arguments(algorithm, permits_per_second, window_size_secs, capacity, now);

        trace!(
            key = %state_key,
            algorithm = %algorithm,
            args = ?args,
            "Checking rate limit"
        );

        let reply = self
            .executor
            .execute(self.program(algorithm), &state_key, &args)
            .await?;

        let admitted = reply == ADMIT;
        if !admitted {
            debug!(
                key = %state_key,
                algorithm = %algorithm,
                "Rate limit exceeded"
            );
        }
        Ok(admitted)
    }

    /// Apply a named rule to `key`.
    ///
    /// A rejection becomes [`LimiterError::RateLimited`], so callers that
    /// propagate with `?` can still tell it apart from a store fault.
    pub async fn acquire_rule(&self, rule: &RateLimitRule, key: &str) -> Result<()> {
        let allowed = self
            .try_acquire(
                key,
                rule.algorithm,
                rule.permits_per_second,
                rule.window_size,
                rule.capacity,
            )
            .await?;

        if allowed {
            return Ok(());
        }

        warn!(
            rule = %rule.name,
            key = %key,
            algorithm = %rule.algorithm,
            permits = rule.permits_per_second,
            window = rule.window_size,
            capacity = rule.capacity,
            "Rate limit exceeded"
        );
        Err(LimiterError::RateLimited {
            key: key.to_string(),
        })
    }

    /// The cached program for `algorithm`.
    pub fn program(&self, algorithm: Algorithm) -> &Program {
        match algorithm {
            Algorithm::FixedWindow => &self.fixed_window,
            Algorithm::SlidingWindow => &self.sliding_window,
            Algorithm::TokenBucket => &self.token_bucket,
        }
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }
}

/// Positional program arguments for one decision.
///
/// The order is part of the stored-state contract shared with other
/// deployments and must not change:
///
/// | algorithm | arguments |
/// |---|---|
/// | fixed window | `limit, expire_secs` |
/// | sliding window | `limit, window_ms, now_ms` |
/// | token bucket | `rate, capacity, now_ms, requested` |
pub fn arguments(
    algorithm: Algorithm,
    permits_per_second: f64,
    window_size_secs: i64,
    capacity: i64,
    now_ms: i64,
) -> Vec<i64> {
    match algorithm {
        Algorithm::FixedWindow => vec![limit_for(permits_per_second), window_size_secs],
        Algorithm::SlidingWindow => vec![
            limit_for(permits_per_second),
            window_size_secs.saturating_mul(1000),
            now_ms,
        ],
        Algorithm::TokenBucket => vec![
            limit_for(permits_per_second),
            capacity_for(permits_per_second, capacity),
            now_ms,
            REQUESTED_TOKENS,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{script_name, ManualClock, MemoryExecutor, StateKey};
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::time::Duration;
    use tokio_test::assert_ok;

    const START: i64 = 1_700_000_000_000;

    fn create_test_limiter() -> (RateLimiter<Arc<MemoryExecutor>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let executor = Arc::new(MemoryExecutor::with_clock(clock.clone()));
        let limiter =
            RateLimiter::with_clock(executor, ScriptRepository::builtin(), clock.clone()).unwrap();
        (limiter, clock)
    }

    async fn decisions(
        limiter: &RateLimiter<Arc<MemoryExecutor>>,
        n: usize,
        key: &str,
        algorithm: Algorithm,
        permits: f64,
        window: i64,
        capacity: i64,
    ) -> Vec<bool> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(
                limiter
                    .try_acquire(key, algorithm, permits, window, capacity)
                    .await
                    .unwrap(),
            );
        }
        out
    }

    #[test]
    fn test_argument_vectors() {
        assert_eq!(arguments(Algorithm::FixedWindow, 2.1, 60, -1, START), vec![3, 60]);
        assert_eq!(
            arguments(Algorithm::SlidingWindow, 2.1, 10, -1, START),
            vec![3, 10_000, START]
        );
        assert_eq!(
            arguments(Algorithm::TokenBucket, 4.0, 1, -1, START),
            vec![4, 8, START, 1]
        );
        assert_eq!(
            arguments(Algorithm::TokenBucket, 2.5, 1, 10, START),
            vec![3, 10, START, 1]
        );
        assert_eq!(
            arguments(Algorithm::SlidingWindow, 1.0, i64::MAX, -1, START),
            vec![1, i64::MAX, START]
        );
    }

    #[tokio::test]
    async fn test_fixed_window_limit_and_reset() {
        let (limiter, clock) = create_test_limiter();

        let results = decisions(&limiter, 4, "user", Algorithm::FixedWindow, 3.0, 1, -1).await;
        assert_eq!(results, vec![true, true, true, false]);

        clock.advance(Duration::from_secs(1));
        assert!(limiter
            .try_acquire("user", Algorithm::FixedWindow, 3.0, 1, -1)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_fixed_window_accept_extends_window() {
        let (limiter, clock) = create_test_limiter();
        let key = StateKey::new(Algorithm::FixedWindow, "user");

        limiter.try_acquire("user", Algorithm::FixedWindow, 2.0, 10, -1).await.unwrap();
        clock.advance(Duration::from_secs(6));
        limiter.try_acquire("user", Algorithm::FixedWindow, 2.0, 10, -1).await.unwrap();

        assert_eq!(limiter.executor().ttl_millis(&key), Some(10_000));
        assert_eq!(limiter.executor().counter(&key), Some(2));
    }

    #[tokio::test]
    async fn test_sliding_window_ages_out_entries() {
        let (limiter, clock) = create_test_limiter();

        let results = decisions(&limiter, 2, "ip", Algorithm::SlidingWindow, 2.0, 10, -1).await;
        assert_eq!(results, vec![true, true]);

        clock.advance(Duration::from_secs(1));
        assert!(!limiter
            .try_acquire("ip", Algorithm::SlidingWindow, 2.0, 10, -1)
            .await
            .unwrap());

        clock.advance(Duration::from_secs(10));
        assert!(limiter
            .try_acquire("ip", Algorithm::SlidingWindow, 2.0, 10, -1)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sliding_window_reject_does_not_record() {
        let (limiter, clock) = create_test_limiter();
        let key = StateKey::new(Algorithm::SlidingWindow, "ip");

        decisions(&limiter, 5, "ip", Algorithm::SlidingWindow, 2.0, 10, -1).await;
        assert_eq!(limiter.executor().window_len(&key), Some(2));

        // The two accepted entries age out together; the rejects left nothing behind.
        clock.advance(Duration::from_millis(10_001));
        let results = decisions(&limiter, 3, "ip", Algorithm::SlidingWindow, 2.0, 10, -1).await;
        assert_eq!(results, vec![true, true, false]);
    }

    #[tokio::test]
    async fn test_token_bucket_refills() {
        let (limiter, clock) = create_test_limiter();

        let results = decisions(&limiter, 6, "api", Algorithm::TokenBucket, 1.0, 1, 5).await;
        assert_eq!(results, vec![true, true, true, true, true, false]);

        clock.advance(Duration::from_millis(2_000));
        let results = decisions(&limiter, 3, "api", Algorithm::TokenBucket, 1.0, 1, 5).await;
        assert_eq!(results, vec![true, true, false]);
    }

    #[tokio::test]
    async fn test_token_bucket_never_exceeds_capacity() {
        let (limiter, clock) = create_test_limiter();
        let key = StateKey::new(Algorithm::TokenBucket, "api");

        limiter.try_acquire("api", Algorithm::TokenBucket, 1.0, 1, 3).await.unwrap();
        clock.advance(Duration::from_secs(3_600));
        limiter.try_acquire("api", Algorithm::TokenBucket, 1.0, 1, 3).await.unwrap();

        let (tokens, timestamp) = limiter.executor().bucket(&key).unwrap();
        assert_eq!(tokens, 2.0);
        assert_eq!(timestamp, START + 3_600_000);
    }

    #[tokio::test]
    async fn test_permits_are_ceiled() {
        let (limiter, _clock) = create_test_limiter();

        let results = decisions(&limiter, 4, "a", Algorithm::FixedWindow, 2.1, 60, -1).await;
        assert_eq!(results, vec![true, true, true, false]);

        let results = decisions(&limiter, 4, "a", Algorithm::SlidingWindow, 2.1, 60, -1).await;
        assert_eq!(results, vec![true, true, true, false]);
    }

    #[tokio::test]
    async fn test_default_token_bucket_capacity() {
        let (limiter, _clock) = create_test_limiter();

        let results = decisions(&limiter, 9, "b", Algorithm::TokenBucket, 4.0, 1, -1).await;
        assert_eq!(results.iter().filter(|allowed| **allowed).count(), 8);
        assert!(!results[8]);
    }

    #[tokio::test]
    async fn test_zero_permits_rejects_everything() {
        let (limiter, _clock) = create_test_limiter();

        assert!(!limiter.try_acquire("z", Algorithm::FixedWindow, 0.0, 1, -1).await.unwrap());
        assert!(!limiter.try_acquire("z", Algorithm::SlidingWindow, 0.0, 1, -1).await.unwrap());
    }

    #[tokio::test]
    async fn test_algorithms_do_not_share_state() {
        let (limiter, _clock) = create_test_limiter();

        let results = decisions(&limiter, 2, "shared", Algorithm::FixedWindow, 1.0, 60, -1).await;
        assert_eq!(results, vec![true, false]);

        assert!(limiter.try_acquire("shared", Algorithm::SlidingWindow, 1.0, 60, -1).await.unwrap());
        assert!(limiter.try_acquire("shared", Algorithm::TokenBucket, 1.0, 60, 1).await.unwrap());
        assert_eq!(limiter.executor().len(), 3);
    }

    #[tokio::test]
    async fn test_custom_namespace() {
        let (limiter, _clock) = create_test_limiter();
        let limiter = limiter.with_namespace(KeyNamespace::new("edge"));

        limiter.try_acquire("k", Algorithm::FixedWindow, 5.0, 60, -1).await.unwrap();

        let key = KeyNamespace::new("edge").key(Algorithm::FixedWindow, "k");
        assert_eq!(limiter.executor().counter(&key), Some(1));
        assert_eq!(limiter.executor().counter(&StateKey::new(Algorithm::FixedWindow, "k")), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_exceed_limit() {
        let (limiter, _clock) = create_test_limiter();
        let limiter = Arc::new(limiter);

        for algorithm in Algorithm::ALL {
            let tasks = (0..64).map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .try_acquire("hot", algorithm, 5.0, 60, 5)
                        .await
                        .unwrap()
                })
            });

            let accepted = join_all(tasks)
                .await
                .into_iter()
                .map(|joined| joined.unwrap())
                .filter(|allowed| *allowed)
                .count();
            assert_eq!(accepted, 5, "{algorithm} admitted {accepted} of 64");
        }
    }

    #[tokio::test]
    async fn test_acquire_rule() {
        let (limiter, _clock) = create_test_limiter();
        let rule = RateLimitRule {
            name: "create_order".to_string(),
            algorithm: Algorithm::FixedWindow,
            permits_per_second: 1.0,
            window_size: 60,
            capacity: -1,
        };

        assert_ok!(limiter.acquire_rule(&rule, "user:7").await);
        let result = limiter.acquire_rule(&rule, "user:7").await;
        assert!(result.is_err_and(|e| e.is_rate_limited()));
    }

    struct FailingExecutor;

    #[async_trait]
    impl AtomicExecutor for FailingExecutor {
        async fn execute(&self, _: &Program, _: &StateKey, _: &[i64]) -> Result<i64> {
            Err(LimiterError::Timeout(Duration::from_millis(50)))
        }
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let limiter = RateLimiter::new(FailingExecutor, ScriptRepository::builtin()).unwrap();

        for algorithm in Algorithm::ALL {
            let result = limiter.try_acquire("k", algorithm, 1.0, 1, -1).await;
            assert!(matches!(result, Err(LimiterError::Timeout(_))));
        }

        let rule = RateLimitRule::default();
        let err = limiter.acquire_rule(&rule, "k").await.unwrap_err();
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn test_missing_script_fails_construction() {
        let dir = std::env::temp_dir().join(format!("quorate-empty-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let scripts = ScriptRepository::new(ScriptSource::Directory(dir.clone()));
        let result = RateLimiter::new(MemoryExecutor::new(), scripts);
        assert!(matches!(result, Err(LimiterError::Script { .. })));

        std::fs::remove_dir_all(dir).unwrap();
    }

    fn override_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("quorate-override-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let builtin = ScriptRepository::builtin();
        for algorithm in Algorithm::ALL {
            let program = builtin.program(algorithm).unwrap();
            std::fs::write(dir.join(script_name(algorithm)), &*program.text).unwrap();
        }
        dir
    }

    #[test]
    fn test_memory_store_rejects_override_scripts() {
        let dir = override_dir();

        let scripts = ScriptRepository::new(ScriptSource::Directory(dir.clone()));
        let result = RateLimiter::new(MemoryExecutor::new(), scripts);
        assert!(matches!(result, Err(LimiterError::Config(_))));

        // Executors that run the program text accept them.
        let scripts = ScriptRepository::new(ScriptSource::Directory(dir.clone()));
        assert_ok!(RateLimiter::new(FailingExecutor, scripts));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = LimiterConfig::from_yaml("namespace:\n  root: edge\n").unwrap();
        let executor = Arc::new(MemoryExecutor::new());
        let limiter = RateLimiter::from_config(executor, &config).unwrap();

        limiter.try_acquire("k", Algorithm::FixedWindow, 5.0, 60, -1).await.unwrap();

        let key = KeyNamespace::new("edge").key(Algorithm::FixedWindow, "k");
        assert_eq!(limiter.executor().counter(&key), Some(1));
    }
}
