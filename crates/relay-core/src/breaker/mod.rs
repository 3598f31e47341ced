//! Circuit breaker pattern for failure isolation.
//!
//! Wraps an arbitrary fallible async call and fails fast once a threshold of
//! consecutive failures is reached, probing recovery with a single half-open
//! trial after a cooldown.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast - calls are rejected until the recovery timeout expires.
    Open,
    /// Testing recovery with exactly one trial call.
    HalfOpen,
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// The circuit is open and the call was rejected without being invoked.
    #[error("Circuit breaker is OPEN")]
    Open,

    /// The half-open trial exceeded its timeout; the circuit re-opened.
    #[error("Half-open timeout")]
    HalfOpenTimeout,

    /// The wrapped call itself failed.
    #[error("{0}")]
    Inner(E),
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Cooldown before an open circuit admits a half-open trial.
    pub recovery_timeout: Duration,
    /// Ceiling for the half-open trial call.
    pub half_open_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Preset for resource discovery calls.
    pub fn discovery() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_timeout: Duration::from_secs(10),
        }
    }

    /// Preset for health-check calls.
    pub fn health_check() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(5),
        }
    }

    /// Preset for generic guarded operations.
    pub fn operation() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::operation()
    }
}

/// Read-only snapshot of a breaker's state and counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    /// Breaker name, for logging and diagnostics.
    pub name: String,
    /// Current circuit state.
    pub state: CircuitState,
    /// Consecutive failure count.
    pub failure_count: u32,
    /// Total successful calls.
    pub success_count: u64,
    /// Calls rejected while the circuit was open.
    pub blocked_calls: u64,
    /// Configured failure threshold.
    pub failure_threshold: u32,
    /// Configured recovery timeout.
    pub recovery_timeout: Duration,
    /// Configured half-open trial timeout.
    pub half_open_timeout: Duration,
    /// When the most recent failure occurred.
    pub last_failure_at: Option<Instant>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    blocked_calls: u64,
    last_failure_at: Option<Instant>,
    /// True while a half-open trial call is outstanding.
    trial_in_flight: bool,
}

/// Circuit breaker guarding one fallible async operation.
///
/// Only the allow/deny decision is serialized; the wrapped call itself runs
/// outside the lock, so multiple calls may be in flight while `Closed`. Only
/// `HalfOpen` restricts concurrency, to exactly one trial call.
pub struct CircuitBreaker {
    /// Breaker name, used in logs.
    name: String,
    /// Configuration.
    config: CircuitBreakerConfig,
    /// Mutable state (thread-safe).
    inner: Mutex<BreakerInner>,
}

/// Outcome of the admission decision, computed under the lock.
enum Admission {
    /// Normal call while closed.
    Normal,
    /// The single half-open trial.
    Trial,
    /// Rejected; fail fast.
    Blocked,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker.
    ///
    /// # Arguments
    /// * `name` - Name used in logs and stats
    /// * `config` - Threshold and timeout configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                blocked_calls: 0,
                last_failure_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Checks whether a call would currently be admitted.
    ///
    /// Read-only: this never transitions state, even when the recovery
    /// timeout has expired.
    pub fn is_call_allowed(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .last_failure_at
                .is_none_or(|at| at.elapsed() >= self.config.recovery_timeout),
            CircuitState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Executes a call through the breaker.
    ///
    /// Rejected calls fail immediately with [`BreakerError::Open`] and
    /// increment the blocked-call counter without invoking `f`. A call
    /// admitted from the `Open` state becomes the half-open trial and is
    /// raced against the configured half-open timeout.
    ///
    /// # Errors
    /// Returns [`BreakerError::Open`] when rejected, [`BreakerError::HalfOpenTimeout`]
    /// when the trial times out, or [`BreakerError::Inner`] with the call's own error.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let admission = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                CircuitState::Closed => Admission::Normal,
                CircuitState::Open => {
                    let cooled_down = inner
                        .last_failure_at
                        .is_none_or(|at| at.elapsed() >= self.config.recovery_timeout);
                    if cooled_down {
                        inner.state = CircuitState::HalfOpen;
                        inner.trial_in_flight = true;
                        debug!(breaker = %self.name, "Circuit breaker: Open -> HalfOpen (trial admitted)");
                        Admission::Trial
                    } else {
                        Admission::Blocked
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        Admission::Blocked
                    } else {
                        inner.trial_in_flight = true;
                        Admission::Trial
                    }
                }
            }
        };

        match admission {
            Admission::Blocked => {
                let mut inner = self.inner.lock().unwrap();
                inner.blocked_calls += 1;
                debug!(
                    breaker = %self.name,
                    blocked_calls = inner.blocked_calls,
                    "Circuit breaker rejected call"
                );
                Err(BreakerError::Open)
            }
            Admission::Normal => match f().await {
                Ok(value) => {
                    self.on_success(false);
                    Ok(value)
                }
                Err(e) => {
                    self.on_failure(false, &e.to_string());
                    Err(BreakerError::Inner(e))
                }
            },
            Admission::Trial => {
                match tokio::time::timeout(self.config.half_open_timeout, f()).await {
                    Ok(Ok(value)) => {
                        self.on_success(true);
                        Ok(value)
                    }
                    Ok(Err(e)) => {
                        self.on_failure(true, &e.to_string());
                        Err(BreakerError::Inner(e))
                    }
                    Err(_) => {
                        self.on_trial_timeout();
                        Err(BreakerError::HalfOpenTimeout)
                    }
                }
            }
        }
    }

    /// Unconditionally returns the breaker to `Closed` with zeroed counters.
    ///
    /// Used for manual operator recovery.
    pub fn force_reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.blocked_calls = 0;
        inner.last_failure_at = None;
        inner.trial_in_flight = false;
        debug!(breaker = %self.name, "Circuit breaker force-reset to Closed");
    }

    /// Returns a read-only snapshot of the breaker.
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock().unwrap();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            blocked_calls: inner.blocked_calls,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout: self.config.recovery_timeout,
            half_open_timeout: self.config.half_open_timeout,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Current circuit state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    fn on_success(&self, was_trial: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.success_count += 1;
        // A success ends any consecutive-failure streak.
        inner.failure_count = 0;
        if was_trial {
            inner.state = CircuitState::Closed;
            inner.trial_in_flight = false;
            debug!(breaker = %self.name, "Circuit breaker: HalfOpen -> Closed (recovery successful)");
        }
    }

    fn on_failure(&self, was_trial: bool, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());
        if was_trial {
            inner.state = CircuitState::Open;
            inner.trial_in_flight = false;
            warn!(breaker = %self.name, error = %error, "Circuit breaker: HalfOpen -> Open (recovery failed)");
        } else if inner.state == CircuitState::Closed
            && inner.failure_count >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            warn!(
                breaker = %self.name,
                failure_count = inner.failure_count,
                threshold = self.config.failure_threshold,
                error = %error,
                "Circuit breaker: Closed -> Open (failure threshold reached)"
            );
        }
    }

    fn on_trial_timeout(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Open;
        inner.trial_in_flight = false;
        // Fresh recovery window.
        inner.last_failure_at = Some(Instant::now());
        warn!(breaker = %self.name, "Circuit breaker: HalfOpen -> Open (half-open timeout)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(threshold: u32, recovery_ms: u64, half_open_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
            half_open_timeout: Duration::from_millis(half_open_ms),
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>("boom".to_string()) })
            .await;
    }

    #[tokio::test]
    async fn test_opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", test_config(3, 60_000, 1_000));

        for _ in 0..3 {
            fail(&breaker).await;
        }

        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.failure_count, 3);
        assert_eq!(stats.blocked_calls, 0);
        assert!(!breaker.is_call_allowed());
    }

    #[tokio::test]
    async fn test_blocked_call_does_not_invoke_function() {
        let breaker = CircuitBreaker::new("test", test_config(3, 60_000, 1_000));
        for _ in 0..3 {
            fail(&breaker).await;
        }

        let mut invoked = false;
        let result = breaker
            .execute(|| {
                invoked = true;
                async { Ok::<_, String>(1) }
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open)));
        assert!(!invoked);
        let stats = breaker.stats();
        assert_eq!(stats.blocked_calls, 1);
        assert_eq!(stats.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_error_message() {
        let breaker = CircuitBreaker::new("test", test_config(1, 60_000, 1_000));
        fail(&breaker).await;

        let err = breaker
            .execute(|| async { Ok::<_, String>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Circuit breaker is OPEN");
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let breaker = CircuitBreaker::new("test", test_config(3, 60_000, 1_000));
        fail(&breaker).await;
        fail(&breaker).await;
        breaker.execute(|| async { Ok::<_, String>(()) }).await.unwrap();
        fail(&breaker).await;

        // Streak was broken, so the circuit stays closed.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_recovery_admits_trial_and_closes_on_success() {
        let breaker = CircuitBreaker::new("test", test_config(2, 100, 1_000));
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(breaker.is_call_allowed());
        // is_call_allowed is read-only: the state has not transitioned.
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.execute(|| async { Ok::<_, String>(()) }).await.unwrap();
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
    }

    #[tokio::test]
    async fn test_failed_trial_reopens_circuit() {
        let breaker = CircuitBreaker::new("test", test_config(2, 100, 1_000));
        fail(&breaker).await;
        fail(&breaker).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        fail(&breaker).await;

        assert_eq!(breaker.state(), CircuitState::Open);
        // The recovery window restarted; calls are rejected again.
        assert!(!breaker.is_call_allowed());
    }

    #[tokio::test]
    async fn test_half_open_timeout_reopens_circuit() {
        let breaker = CircuitBreaker::new("test", test_config(1, 50, 50));
        fail(&breaker).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let result = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, String>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::HalfOpenTimeout)));
        assert_eq!(result.unwrap_err().to_string(), "Half-open timeout");
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admits_exactly_one_trial() {
        let breaker = std::sync::Arc::new(CircuitBreaker::new("test", test_config(1, 50, 5_000)));
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let slow = std::sync::Arc::clone(&breaker);
        let trial = tokio::spawn(async move {
            slow.execute(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, String>(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // While the trial is outstanding, a second call is rejected.
        assert!(!breaker.is_call_allowed());
        let second = breaker.execute(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(second, Err(BreakerError::Open)));

        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_force_reset() {
        let breaker = CircuitBreaker::new("test", test_config(1, 60_000, 1_000));
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.force_reset();

        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.blocked_calls, 0);
        assert!(breaker.is_call_allowed());
    }

    #[tokio::test]
    async fn test_stats_snapshot_is_idempotent() {
        let breaker = CircuitBreaker::new("test", test_config(3, 60_000, 1_000));
        fail(&breaker).await;

        let first = breaker.stats();
        let second = breaker.stats();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_inner_error_passthrough() {
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::operation());
        let err = breaker
            .execute(|| async { Err::<(), _>("backend unavailable".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "backend unavailable");
    }
}
