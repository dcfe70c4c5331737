//! Quorate - Distributed Rate Limiting Engine
//!
//! This crate decides whether a request for a caller key may proceed using
//! a fixed window, sliding window or token bucket. All rate-limit state
//! lives in Redis and every decision is a single atomic Lua script, so any
//! number of processes can share limits without client-side locking.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{LimiterError, Result};
pub use ratelimit::{Algorithm, RateLimiter};
