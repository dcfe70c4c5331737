use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use quorate::config::LimiterConfig;
use quorate::ratelimit::{
    script_name, Algorithm, AtomicExecutor, MemoryExecutor, RateLimiter, RedisExecutor,
    ScriptRepository,
};

/// Query and exercise a Quorate rate limiter.
#[derive(Debug, Parser)]
#[command(name = "quorate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Use an in-process store instead of Redis
    #[arg(long, global = true)]
    memory: bool,

    /// Print decisions as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one or more decisions with explicit parameters
    Acquire {
        /// Caller key
        #[arg(short, long)]
        key: String,

        /// Algorithm name; unknown names fall back to token_bucket
        #[arg(short, long, default_value = "token_bucket")]
        algorithm: String,

        /// Nominal permits per second
        #[arg(short, long, default_value_t = 1.0)]
        permits: f64,

        /// Window size in seconds
        #[arg(short, long, default_value_t = 1)]
        window: i64,

        /// Bucket capacity, -1 to derive it from the rate
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        capacity: i64,

        /// Number of decisions to run
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
    /// Run one or more decisions through a configured rule
    Rule {
        /// Rule name
        #[arg(long)]
        name: String,

        /// Caller key
        #[arg(short, long)]
        key: String,

        /// Number of decisions to run
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
    /// Print the algorithm programs in use
    Scripts,
}

#[derive(Debug, Serialize)]
struct Decision<'a> {
    seq: usize,
    key: &'a str,
    algorithm: Algorithm,
    allowed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = LimiterConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Scripts => {
            let scripts = ScriptRepository::new(config.scripts.source());
            for algorithm in Algorithm::ALL {
                let program = scripts.program(algorithm)?;
                println!("-- {} ({})", script_name(algorithm), algorithm);
                println!("{}", program.text);
            }
        }
        Command::Acquire {
            key,
            algorithm,
            permits,
            window,
            capacity,
            count,
        } => {
            let algorithm = Algorithm::parse_lenient(&algorithm);
            let limiter = build_limiter(cli.memory, &config).await?;
            for seq in 1..=count {
                let allowed = limiter
                    .try_acquire(&key, algorithm, permits, window, capacity)
                    .await?;
                report(cli.json, &Decision { seq, key: &key, algorithm, allowed })?;
            }
        }
        Command::Rule { name, key, count } => {
            let rules = config.rule_set()?;
            let rule = rules
                .get(&name)
                .ok_or_else(|| anyhow::anyhow!("no rule named `{}`", name))?;
            let limiter = build_limiter(cli.memory, &config).await?;
            for seq in 1..=count {
                let allowed = match limiter.acquire_rule(rule, &key).await {
                    Ok(()) => true,
                    Err(e) if e.is_rate_limited() => false,
                    Err(e) => return Err(e.into()),
                };
                report(
                    cli.json,
                    &Decision { seq, key: &key, algorithm: rule.algorithm, allowed },
                )?;
            }
        }
    }

    Ok(())
}

async fn build_limiter(
    memory: bool,
    config: &LimiterConfig,
) -> anyhow::Result<RateLimiter<Arc<dyn AtomicExecutor>>> {
    let executor: Arc<dyn AtomicExecutor> = if memory {
        info!("Using in-process store");
        Arc::new(MemoryExecutor::new())
    } else {
        Arc::new(RedisExecutor::connect(&config.redis).await?)
    };

    let limiter = RateLimiter::from_config(executor, config)?;
    info!(root = %limiter.namespace().root(), "Rate limiter initialized");
    Ok(limiter)
}

fn report(json: bool, decision: &Decision<'_>) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(decision)?);
    } else {
        let verdict = if decision.allowed { "allowed" } else { "rejected" };
        println!(
            "{:>4} {} [{}] {}",
            decision.seq, decision.key, decision.algorithm, verdict
        );
    }
    Ok(())
}

/// Initialize tracing, honouring `RUST_LOG` when set.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::WARN.to_string()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.with_thread_ids(true).init(),
        LogFormat::Json => builder.json().init(),
    }
}
