//! Process-local guards against self-inflicted overload.
//!
//! The rate limiter and circuit breaker are in-memory and per-process; if
//! several processes share a store they must not rely on these for global
//! enforcement.

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use rate_limiter::RateLimiter;
