//! Circuit breakers and retry for every dependency boundary.
//!
//! Each external dependency (upstream stream, primary store, cache, price
//! oracle) gets one named breaker instance; all calls to that dependency go
//! through `execute` so consecutive failures trip the gate instead of piling
//! up timeouts.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::error::{CoreError, CoreResult};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted.
    Closed,
    /// Calls fail fast until the cooldown elapses.
    Open,
    /// Probe mode: one failure reopens, M successes close.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Per-instance breaker tuning
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip closed -> open
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// How long the circuit stays open before probing
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(60),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    next_attempt_at: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig, clock: SharedClock) -> Self {
        metrics::set_circuit_state(name, CircuitState::Closed);
        Self {
            name,
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                next_attempt_at: None,
            }),
        }
    }

    /// Breaker for the upstream indexer stream
    pub fn upstream_stream(clock: SharedClock) -> Self {
        Self::new(
            "upstream-stream",
            BreakerConfig {
                failure_threshold: 5,
                success_threshold: 2,
                cooldown: Duration::from_secs(300),
            },
            clock,
        )
    }

    /// Breaker for the primary relational store
    pub fn primary_store(clock: SharedClock) -> Self {
        Self::new(
            "primary-store",
            BreakerConfig {
                failure_threshold: 5,
                success_threshold: 2,
                cooldown: Duration::from_secs(120),
            },
            clock,
        )
    }

    /// Breaker for the cache backend
    pub fn cache(clock: SharedClock) -> Self {
        Self::new(
            "cache",
            BreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                cooldown: Duration::from_secs(60),
            },
            clock,
        )
    }

    /// Breaker for the price oracle
    pub fn oracle(clock: SharedClock) -> Self {
        Self::new(
            "oracle",
            BreakerConfig {
                failure_threshold: 5,
                success_threshold: 2,
                cooldown: Duration::from_secs(300),
            },
            clock,
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Whether a call issued now would be allowed through.
    pub fn is_available(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match inner.next_attempt_at {
                Some(at) => self.clock.now() >= at,
                None => true,
            },
        }
    }

    /// Run `op` through the breaker. Fails fast with `Unavailable` while the
    /// circuit is open and the cooldown has not elapsed.
    pub async fn execute<T, F, Fut>(&self, op: F) -> CoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        self.check_gate()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Run `op` through the breaker, producing `fallback()` on any failure
    /// (including fail-fast while open).
    pub async fn execute_with_fallback<T, F, Fut, FB>(&self, op: F, fallback: FB) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
        FB: FnOnce() -> T,
    {
        match self.execute(op).await {
            Ok(value) => value,
            Err(e) => {
                debug!(
                    breaker = self.name,
                    error = %e,
                    "Falling back after breaker-guarded call failed"
                );
                fallback()
            }
        }
    }

    /// Gate check: pass while closed/half-open; while open, allow a probe
    /// once the cooldown has elapsed.
    fn check_gate(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let ready = match inner.next_attempt_at {
                    Some(at) => self.clock.now() >= at,
                    None => true,
                };
                if ready {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    Ok(())
                } else {
                    Err(CoreError::Unavailable {
                        dependency: self.name,
                    })
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                metrics::set_consecutive_failures(self.name, inner.consecutive_failures);
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.next_attempt_at = Some(
                        self.clock.now()
                            + chrono::Duration::from_std(self.config.cooldown)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                    );
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Any probe failure reopens and restarts the cooldown
                inner.next_attempt_at = Some(
                    self.clock.now()
                        + chrono::Duration::from_std(self.config.cooldown)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                );
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        warn!(
            breaker = self.name,
            from = inner.state.as_str(),
            to = to.as_str(),
            "Circuit state change"
        );
        inner.state = to;
        inner.consecutive_successes = 0;
        if to == CircuitState::Closed {
            inner.consecutive_failures = 0;
            inner.next_attempt_at = None;
            metrics::set_consecutive_failures(self.name, 0);
        }
        metrics::set_circuit_state(self.name, to);
    }
}

/// Execute `op` up to `max_attempts` times, sleeping `base_delay * 2^(i-1)`
/// after the i-th failure. The last error is surfaced when the budget is
/// exhausted.
pub async fn retry_with_backoff<T, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let mut last_error = None;
    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(
                    attempt,
                    max = max_attempts,
                    error = %e,
                    "Attempt failed"
                );
                let retriable = attempt < max_attempts;
                last_error = Some(e);
                if retriable {
                    let delay = base_delay * 2u32.saturating_pow(attempt - 1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    match last_error {
        Some(e) => Err(e),
        None => Err(CoreError::Validation(
            "retry requires at least one attempt".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::TimeZone;

    use super::*;
    use crate::clock::testing::ManualClock;

    fn manual_clock() -> std::sync::Arc<ManualClock> {
        ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap())
    }

    fn test_breaker(clock: SharedClock) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                cooldown: Duration::from_secs(60),
            },
            clock,
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> CoreResult<u32> {
        breaker
            .execute(|| async { Err(CoreError::Stream("boom".to_string())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> CoreResult<u32> {
        breaker.execute(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let clock = manual_clock();
        let breaker = test_breaker(clock.clone());

        assert_eq!(breaker.state(), CircuitState::Closed);
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Fails fast without invoking the op
        let result: CoreResult<u32> = breaker
            .execute(|| async { unreachable!("op must not run while open") })
            .await;
        assert!(matches!(result, Err(CoreError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let clock = manual_clock();
        let breaker = test_breaker(clock.clone());

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        // Only two consecutive failures since the success
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_after_cooldown_then_closes() {
        let clock = manual_clock();
        let breaker = test_breaker(clock.clone());

        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_available());

        clock.advance(chrono::Duration::seconds(61));
        assert!(breaker.is_available());

        // First probe succeeds -> still half-open (success_threshold = 2)
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Second success closes
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let clock = manual_clock();
        let breaker = test_breaker(clock.clone());

        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        clock.advance(chrono::Duration::seconds(61));

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Cooldown restarted: still unavailable until another full cooldown
        clock.advance(chrono::Duration::seconds(30));
        assert!(!breaker.is_available());
        clock.advance(chrono::Duration::seconds(31));
        assert!(breaker.is_available());
    }

    #[tokio::test]
    async fn test_fallback_on_open_circuit() {
        let clock = manual_clock();
        let breaker = test_breaker(clock.clone());

        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        let value = breaker
            .execute_with_fallback(|| async { Ok::<_, CoreError>(1u32) }, || 42u32)
            .await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_retry_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: CoreResult<u32> =
            retry_with_backoff(3, Duration::from_millis(1), || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(CoreError::Stream(format!("failure {}", n)))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(CoreError::Stream(msg)) => assert_eq!(msg, "failure 3"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_retry_stops_on_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(5, Duration::from_millis(1), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(CoreError::Stream("transient".to_string()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
