//! Circuit breaker for protected operations.
//!
//! One breaker entry per protected operation (keyed by name). Five
//! consecutive failures open the circuit; after a cooldown the next call
//! is admitted as a half-open probe. State is process-local and not
//! persisted.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Circuit state for a protected operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Fast-failing until the cooldown expires.
    Open(Instant),
    /// One probe call is allowed through.
    HalfOpen,
}

struct Entry {
    state: CircuitState,
    consecutive_failures: u32,
}

/// Per-operation circuit breaker.
pub struct CircuitBreaker {
    entries: RwLock<HashMap<String, Entry>>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    /// Creates a breaker with the default shape: 5 consecutive failures
    /// trip it, open state lasts 60 seconds.
    pub fn new() -> Self {
        Self::with_settings(5, Duration::from_secs(60))
    }

    /// Creates a breaker with a custom threshold and cooldown.
    pub fn with_settings(threshold: u32, cooldown: Duration) -> Self {
        Self { entries: RwLock::new(HashMap::new()), threshold, cooldown }
    }

    /// Checks whether a call to `operation` may proceed.
    ///
    /// An open circuit whose cooldown has expired transitions to half-open
    /// and admits this call as the probe.
    pub fn check(&self, operation: &str) -> bool {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry(operation.to_string())
            .or_insert(Entry { state: CircuitState::Closed, consecutive_failures: 0 });

        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open(opened_at) => {
                if opened_at.elapsed() >= self.cooldown {
                    entry.state = CircuitState::HalfOpen;
                    debug!(operation, "circuit breaker: Open -> HalfOpen (probe admitted)");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful call; a half-open probe success closes the
    /// circuit and resets the failure count.
    pub fn record_success(&self, operation: &str) {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(operation) {
            if entry.state == CircuitState::HalfOpen {
                debug!(operation, "circuit breaker: HalfOpen -> Closed (recovered)");
            }
            entry.state = CircuitState::Closed;
            entry.consecutive_failures = 0;
        }
    }

    /// Records a failed call; trips the circuit at the failure threshold,
    /// and re-opens it with a fresh timer on a failed half-open probe.
    pub fn record_failure(&self, operation: &str) {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry(operation.to_string())
            .or_insert(Entry { state: CircuitState::Closed, consecutive_failures: 0 });

        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open(Instant::now());
                warn!(operation, "circuit breaker: HalfOpen -> Open (probe failed)");
            }
            CircuitState::Open(_) => {}
            CircuitState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.threshold {
                    entry.state = CircuitState::Open(Instant::now());
                    warn!(
                        operation,
                        failures = entry.consecutive_failures,
                        "circuit breaker: Closed -> Open"
                    );
                }
            }
        }
    }

    /// Returns the current state for an operation.
    pub fn state(&self, operation: &str) -> CircuitState {
        let entries = self.entries.read().unwrap();
        entries.get(operation).map_or(CircuitState::Closed, |e| e.state)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_by_default() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.check("op"));
        assert_eq!(breaker.state("op"), CircuitState::Closed);
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new();
        for _ in 0..5 {
            breaker.record_failure("op");
        }
        assert!(matches!(breaker.state("op"), CircuitState::Open(_)));
        assert!(!breaker.check("op"));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new();
        for _ in 0..4 {
            breaker.record_failure("op");
        }
        breaker.record_success("op");
        for _ in 0..4 {
            breaker.record_failure("op");
        }
        assert_eq!(breaker.state("op"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let breaker = CircuitBreaker::with_settings(1, Duration::from_millis(20));
        breaker.record_failure("op");
        assert!(!breaker.check("op"));

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.check("op"));
        assert_eq!(breaker.state("op"), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::with_settings(1, Duration::from_millis(20));
        breaker.record_failure("op");
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.check("op"));
        breaker.record_success("op");
        assert_eq!(breaker.state("op"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::with_settings(1, Duration::from_millis(20));
        breaker.record_failure("op");
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.check("op"));
        breaker.record_failure("op");
        assert!(matches!(breaker.state("op"), CircuitState::Open(_)));
        assert!(!breaker.check("op"));
    }

    #[test]
    fn test_operations_are_independent() {
        let breaker = CircuitBreaker::with_settings(1, Duration::from_secs(60));
        breaker.record_failure("a");
        assert!(!breaker.check("a"));
        assert!(breaker.check("b"));
    }
}
