//! Circuit breaker guarding the database endpoint

use crate::metrics::SharedMetrics;
use crate::{BridgeError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial request is allowed
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: crate::config::CIRCUIT_FAILURE_THRESHOLD,
            cooldown: Duration::from_millis(crate::config::CIRCUIT_COOLDOWN_MS),
        }
    }
}

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected until the cool-down ends
    Open,
    /// One trial request is allowed through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Instant,
}

/// Consecutive-failure circuit breaker.
///
/// Callers ask for permission with [`CircuitBreaker::try_acquire`] before
/// every request and report the outcome with `record_success` or
/// `record_failure`.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: CircuitConfig,
    metrics: SharedMetrics,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig, metrics: SharedMetrics) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: Instant::now(),
            }),
            config,
            metrics,
        }
    }

    /// Ask to send a request.
    ///
    /// Fails with [`BridgeError::CircuitOpen`] while open, and while a
    /// half-open trial request is outstanding. The first call after the cool-down
    /// becomes the trial request.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.elapsed();
                if elapsed >= self.config.cooldown {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    Ok(())
                } else {
                    Err(BridgeError::CircuitOpen {
                        retry_in: self.config.cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => Err(BridgeError::CircuitOpen {
                retry_in: self.config.cooldown,
            }),
        }
    }

    /// Report a request that reached the database
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    /// Report a transient failure
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            CircuitState::HalfOpen => self.open(&mut inner),
            CircuitState::Closed
                if inner.consecutive_failures >= self.config.failure_threshold =>
            {
                self.open(&mut inner)
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Remaining cool-down while the circuit is open
    pub fn retry_in(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return None;
        }
        self.config
            .cooldown
            .checked_sub(inner.opened_at.elapsed())
            .filter(|d| !d.is_zero())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.opened_at = Instant::now();
        self.transition(inner, CircuitState::Open);
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        if to == CircuitState::Open {
            warn!(
                failures = inner.consecutive_failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "Circuit {} -> {}", from, to
            );
        } else {
            info!("Circuit {} -> {}", from, to);
        }
        self.metrics.circuit_transition(from, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PipelineMetrics;
    use std::sync::Arc;

    fn breaker(threshold: u32, cooldown_ms: u64) -> (CircuitBreaker, Arc<PipelineMetrics>) {
        let metrics = Arc::new(PipelineMetrics::new());
        let config = CircuitConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
        };
        (CircuitBreaker::new(config, metrics.clone()), metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let (breaker, metrics) = breaker(3, 1000);
        for _ in 0..2 {
            breaker.try_acquire().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.try_acquire(), Err(BridgeError::CircuitOpen { .. })));
        assert_eq!(breaker.retry_in(), Some(Duration::from_millis(1000)));
        assert_eq!(metrics.snapshot().circuit_opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_count() {
        let (breaker, _) = breaker(2, 1000);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_closes_on_success() {
        let (breaker, metrics) = breaker(1, 500);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(breaker.retry_in(), None);
        breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // only one trial request at a time
        assert!(breaker.try_acquire().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.try_acquire().unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.circuit_opened, 1);
        assert_eq!(snapshot.circuit_half_opened, 1);
        assert_eq!(snapshot.circuit_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens() {
        let (breaker, metrics) = breaker(1, 500);
        breaker.record_failure();

        tokio::time::advance(Duration::from_millis(500)).await;
        breaker.try_acquire().unwrap();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.retry_in(), Some(Duration::from_millis(500)));
        assert_eq!(metrics.snapshot().circuit_opened, 2);
    }
}
