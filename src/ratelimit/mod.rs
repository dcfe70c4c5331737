//! Rate limiting decision engine.

mod algorithm;
mod clock;
mod executor;
mod key;
mod limiter;
mod memory;
mod redis;
mod rules;
mod scripts;

pub use algorithm::{capacity_for, limit_for, Algorithm};
pub use clock::{Clock, ManualClock, SystemClock};
pub use executor::AtomicExecutor;
pub use key::{KeyNamespace, StateKey, DEFAULT_ROOT};
pub use limiter::{arguments, RateLimiter};
pub use memory::MemoryExecutor;
pub use self::redis::RedisExecutor;
pub use rules::{RateLimitRule, RuleSet};
pub use scripts::{script_name, Program, ScriptRepository, ScriptSource};
