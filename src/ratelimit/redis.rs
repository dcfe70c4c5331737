//! Redis-backed atomic executor.
//!
//! Programs run through `EVALSHA`, with the client falling back to `EVAL`
//! when the server does not have the script cached yet.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tracing::{debug, error, info, trace};

use super::executor::AtomicExecutor;
use super::key::StateKey;
use super::scripts::Program;
use crate::config::RedisConfig;
use crate::error::{LimiterError, Result};

/// Executes algorithm programs as Lua scripts on a Redis server.
#[derive(Clone)]
pub struct RedisExecutor {
    conn: MultiplexedConnection,
    response_timeout: Option<Duration>,
    scripts: Arc<ScriptCache>,
}

impl std::fmt::Debug for RedisExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisExecutor")
            .field("response_timeout", &self.response_timeout)
            .field("scripts", &self.scripts.len())
            .finish()
    }
}

impl RedisExecutor {
    /// Connect to the server described by `config`.
    ///
    /// Connection setup is bounded by `connection_timeout_ms` when set.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let url = sanitize_url(&config.url);
        info!(url = %url, "Connecting to Redis");

        let client = Client::open(config.url.as_str())?;
        let connecting = client.get_multiplexed_async_connection();
        let conn = match config.connection_timeout() {
            Some(limit) => tokio::time::timeout(limit, connecting).await.map_err(|_| {
                error!(url = %url, timeout = ?limit, "Timed out connecting to Redis");
                LimiterError::Timeout(limit)
            })??,
            None => connecting.await?,
        };

        info!("Redis connection established");
        Ok(Self {
            conn,
            response_timeout: config.response_timeout(),
            scripts: Arc::new(ScriptCache::default()),
        })
    }

    /// Round-trip a `PING` to the server.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!("Redis health check passed");
        Ok(())
    }
}

#[async_trait]
impl AtomicExecutor for RedisExecutor {
    async fn execute(&self, program: &Program, key: &StateKey, args: &[i64]) -> Result<i64> {
        let script = self.scripts.get(program);
        let mut invocation = script.prepare_invoke();
        invocation.key(key.as_str());
        for arg in args {
            invocation.arg(*arg);
        }

        trace!(
            key = %key,
            algorithm = %program.algorithm,
            args = ?args,
            "Invoking rate limit script"
        );

        let mut conn = self.conn.clone();
        let reply: redis::RedisResult<i64> = match self.response_timeout {
            Some(limit) => tokio::time::timeout(limit, invocation.invoke_async(&mut conn))
                .await
                .map_err(|_| {
                    error!(key = %key, timeout = ?limit, "Rate limit script timed out");
                    LimiterError::Timeout(limit)
                })?,
            None => invocation.invoke_async(&mut conn).await,
        };

        reply.map_err(|e| {
            error!(key = %key, error = %e, "Rate limit script failed");
            LimiterError::Store(e)
        })
    }
}

/// Script handles keyed by program text, so each program is hashed once.
#[derive(Default)]
struct ScriptCache {
    scripts: DashMap<Arc<str>, Arc<Script>>,
}

impl ScriptCache {
    fn get(&self, program: &Program) -> Arc<Script> {
        if let Some(script) = self.scripts.get(&*program.text) {
            return Arc::clone(script.value());
        }
        let entry = self
            .scripts
            .entry(program.text.clone())
            .or_insert_with(|| Arc::new(Script::new(&program.text)));
        Arc::clone(entry.value())
    }

    fn len(&self) -> usize {
        self.scripts.len()
    }
}

/// Hide any password in a Redis URL before logging it.
fn sanitize_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
