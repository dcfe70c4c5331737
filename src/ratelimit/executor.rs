//! Atomic executor trait for abstracting the backing store.

use async_trait::async_trait;

use super::key::StateKey;
use super::scripts::Program;
use crate::error::Result;

/// Runs one algorithm program against one state key as a single indivisible
/// step.
///
/// Implementations marshal arguments and the integer reply; they never
/// interpret the reply. No other execution against the same key may
/// interleave its reads and writes with this one.
#[async_trait]
pub trait AtomicExecutor: Send + Sync {
    /// Execute `program` against `key` with positional `args`.
    async fn execute(&self, program: &Program, key: &StateKey, args: &[i64]) -> Result<i64>;

    /// Whether [`Program::text`] is what gets executed. Executors that
    /// carry their own rendition of the built-in programs return `false`.
    fn runs_program_text(&self) -> bool {
        true
    }
}

#[async_trait]
impl<E: AtomicExecutor + ?Sized> AtomicExecutor for std::sync::Arc<E> {
    async fn execute(&self, program: &Program, key: &StateKey, args: &[i64]) -> Result<i64> {
        (**self).execute(program, key, args).await
    }

    fn runs_program_text(&self) -> bool {
        (**self).runs_program_text()
    }
}
