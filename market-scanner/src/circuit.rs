//! Circuit breaker guarding the level-refresh pipeline.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum CircuitState {
    /// Circuit is closed (normal operation).
    Closed,
    /// Circuit is open (calls suppressed).
    Open,
    /// Cooldown elapsed, next call tests recovery.
    HalfOpen,
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a trial call.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_errors: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-error circuit breaker.
///
/// Owned by the fetcher instance rather than being process-global, so each scanner (and each
/// test) has its own counter.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_errors: 0,
                opened_at: None,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, moving `Open -> HalfOpen` once the cooldown has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.poll_cooldown(&mut inner);
        inner.state
    }

    /// Check whether a call may proceed.
    pub fn is_allowed(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.inner.lock().consecutive_errors
    }

    /// Record a successful call, closing the circuit.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker closed after successful trial call");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_errors = 0;
        inner.opened_at = None;
    }

    /// Record a failed call, opening the circuit on threshold or on a failed trial call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.poll_cooldown(&mut inner);
        inner.consecutive_errors = inner.consecutive_errors.saturating_add(1);

        let trip = match inner.state {
            CircuitState::Closed => inner.consecutive_errors >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trip {
            warn!(
                consecutive_errors = inner.consecutive_errors,
                cooldown_secs = self.config.cooldown.as_secs(),
                "Circuit breaker opened, suppressing level refresh"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_errors = 0;
        inner.opened_at = None;
    }

    fn poll_cooldown(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let cooled_down = inner
            .opened_at
            .map(|opened_at| opened_at.elapsed() >= self.config.cooldown)
            .unwrap_or(true);
        if cooled_down {
            info!("Circuit breaker half-open, allowing trial call");
            inner.state = CircuitState::HalfOpen;
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
