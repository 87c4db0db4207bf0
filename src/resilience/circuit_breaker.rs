//! # Circuit Breaker Implementation
//!
//! Per-connection fault isolation with three states: Closed (normal
//! operation), Open (failing fast) and Half-Open (a single probe decides
//! recovery).
//!
//! State and the rolling failure window sit behind one `parking_lot::Mutex`
//! per breaker so every admission and outcome is linearizable. The current
//! state is mirrored into an `AtomicU8` for lock-free reads, and call
//! counters are plain atomics.

use crate::error::GatewayError;
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use crate::telemetry::{BreakerTransition, NoopSink, TelemetrySink, TransitionReason};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lock-free counters for circuit breaker metrics
#[derive(Debug)]
struct AtomicCircuitBreakerMetrics {
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    rejected_count: AtomicU64,
    probe_count: AtomicU64,
    total_duration_nanos: AtomicU64,
}

impl AtomicCircuitBreakerMetrics {
    fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
            probe_count: AtomicU64::new(0),
            total_duration_nanos: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record_success(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    #[inline]
    fn record_failure(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self, state: CircuitState, window_failures: u64) -> CircuitBreakerMetrics {
        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let failure_count = self.failure_count.load(Ordering::Relaxed);
        let total_duration_nanos = self.total_duration_nanos.load(Ordering::Relaxed);

        let (failure_rate, average_duration) = if total_calls > 0 {
            (
                failure_count as f64 / total_calls as f64,
                Duration::from_nanos(total_duration_nanos / total_calls),
            )
        } else {
            (0.0, Duration::ZERO)
        };

        CircuitBreakerMetrics {
            total_calls,
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count,
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
            window_failures,
            probe_count: self.probe_count.load(Ordering::Relaxed),
            total_duration: Duration::from_nanos(total_duration_nanos),
            current_state: state,
            failure_rate,
            average_duration,
        }
    }
}

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// Testing recovery - exactly one probe call is in flight
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open, // Default to safest state
        }
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open (or a probe is already in flight), rejecting the call
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl From<CircuitBreakerError<GatewayError>> for GatewayError {
    fn from(error: CircuitBreakerError<GatewayError>) -> Self {
        match error {
            CircuitBreakerError::CircuitOpen { component } => GatewayError::CircuitOpen { component },
            CircuitBreakerError::OperationFailed(inner) => inner,
        }
    }
}

/// Decides whether an error counts against the breaker.
///
/// Errors that prove the dependency answered (validation, auth, not found)
/// are recorded as successes.
pub trait TripsBreaker {
    fn trips_breaker(&self) -> bool;
}

impl TripsBreaker for GatewayError {
    fn trips_breaker(&self) -> bool {
        self.is_retryable()
    }
}

/// Mutable breaker state guarded by the per-breaker mutex
#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerCore {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Admission ticket for one call through the breaker.
///
/// Must be settled with [`CircuitBreaker::record_success`] or
/// [`CircuitBreaker::record_failure`]. A probe permit dropped unsettled
/// (the caller's future was cancelled) reopens the circuit.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    started: Instant,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.abandon_probe();
        }
    }
}

/// Core circuit breaker implementation
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Connection id (or component name) for logging and metrics
    name: String,

    /// Mirror of `core.state` for lock-free reads
    state: AtomicU8,

    core: Mutex<BreakerCore>,

    config: CircuitBreakerConfig,

    metrics: AtomicCircuitBreakerMetrics,

    telemetry: Arc<dyn TelemetrySink>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self::with_telemetry(name, config, Arc::new(NoopSink))
    }

    /// Create a breaker that reports transitions to `telemetry`
    pub fn with_telemetry(
        name: String,
        config: CircuitBreakerConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            window_ms = config.window.as_millis() as u64,
            cool_down_ms = config.cool_down.as_millis() as u64,
            "Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            core: Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
            config,
            metrics: AtomicCircuitBreakerMetrics::new(),
            telemetry,
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Get component name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TripsBreaker,
    {
        let permit = self.try_acquire().map_err(|_| CircuitBreakerError::CircuitOpen {
            component: self.name.clone(),
        })?;

        let result = operation().await;

        match &result {
            Err(err) if err.trips_breaker() => self.record_failure(permit),
            _ => self.record_success(permit),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Admit a call or reject it with `CircuitOpen`.
    ///
    /// In `Open`, the first call after the cool-down becomes the half-open
    /// probe; concurrent callers are rejected until it settles.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, GatewayError> {
        let mut transition = None;
        let admitted = {
            let mut core = self.core.lock();
            match core.state {
                CircuitState::Closed => Some(false),
                CircuitState::Open => {
                    let cooled = core
                        .opened_at
                        .map_or(true, |opened| opened.elapsed() >= self.config.cool_down);
                    if cooled {
                        transition = Some(self.set_state(
                            &mut core,
                            CircuitState::HalfOpen,
                            TransitionReason::CoolDownElapsed,
                        ));
                        core.probe_in_flight = true;
                        Some(true)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    if core.probe_in_flight {
                        None
                    } else {
                        core.probe_in_flight = true;
                        Some(true)
                    }
                }
            }
        };
        self.emit(transition);

        match admitted {
            Some(probe) => {
                if probe {
                    self.metrics.probe_count.fetch_add(1, Ordering::Relaxed);
                    debug!(component = %self.name, "Admitting half-open probe");
                }
                Ok(CallPermit {
                    breaker: self,
                    probe,
                    started: Instant::now(),
                    settled: false,
                })
            }
            None => {
                self.metrics.rejected_count.fetch_add(1, Ordering::Relaxed);
                Err(GatewayError::CircuitOpen {
                    component: self.name.clone(),
                })
            }
        }
    }

    /// Settle a permit as success
    pub fn record_success(&self, mut permit: CallPermit<'_>) {
        permit.settled = true;
        let duration = permit.started.elapsed();
        self.metrics.record_success(duration);

        let transition = {
            let mut core = self.core.lock();
            if permit.probe && core.state == CircuitState::HalfOpen {
                core.probe_in_flight = false;
                core.failures.clear();
                core.opened_at = None;
                Some(self.set_state(
                    &mut core,
                    CircuitState::Closed,
                    TransitionReason::ProbeSucceeded,
                ))
            } else {
                None
            }
        };

        if transition.is_some() {
            info!(component = %self.name, "Circuit breaker closed (recovered)");
        }
        self.emit(transition);
    }

    /// Settle a permit as a transient failure
    pub fn record_failure(&self, mut permit: CallPermit<'_>) {
        permit.settled = true;
        let duration = permit.started.elapsed();
        self.metrics.record_failure(duration);

        let now = Instant::now();
        let transition = {
            let mut core = self.core.lock();
            match core.state {
                CircuitState::HalfOpen if permit.probe => {
                    core.probe_in_flight = false;
                    Some(self.open(&mut core, now, TransitionReason::ProbeFailed))
                }
                CircuitState::Closed => {
                    core.failures.push_back(now);
                    core.prune(now, self.config.window);
                    if core.failures.len() as u64 >= u64::from(self.config.failure_threshold) {
                        Some(self.open(&mut core, now, TransitionReason::FailureThreshold))
                    } else {
                        None
                    }
                }
                // A call admitted while closed that finishes after the
                // circuit opened only adds to the counters.
                _ => None,
            }
        };

        if transition.is_some() {
            error!(
                component = %self.name,
                failure_threshold = self.config.failure_threshold,
                cool_down_ms = self.config.cool_down.as_millis() as u64,
                "Circuit breaker opened (failing fast)"
            );
        } else {
            debug!(
                component = %self.name,
                duration_ms = duration.as_millis() as u64,
                "Failure recorded"
            );
        }
        self.emit(transition);
    }

    fn abandon_probe(&self) {
        let transition = {
            let mut core = self.core.lock();
            if core.state == CircuitState::HalfOpen && core.probe_in_flight {
                core.probe_in_flight = false;
                Some(self.open(&mut core, Instant::now(), TransitionReason::ProbeAbandoned))
            } else {
                None
            }
        };
        if transition.is_some() {
            warn!(component = %self.name, "Half-open probe abandoned, reopening circuit");
        }
        self.emit(transition);
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "Circuit breaker forced open");
        let transition = {
            let mut core = self.core.lock();
            core.probe_in_flight = false;
            Some(self.open(&mut core, Instant::now(), TransitionReason::ForcedOpen))
        };
        self.emit(transition);
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "Circuit breaker forced closed");
        let transition = {
            let mut core = self.core.lock();
            core.probe_in_flight = false;
            core.failures.clear();
            core.opened_at = None;
            Some(self.set_state(&mut core, CircuitState::Closed, TransitionReason::ForcedClosed))
        };
        self.emit(transition);
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let (state, window_failures) = {
            let mut core = self.core.lock();
            core.prune(Instant::now(), self.config.window);
            (core.state, core.failures.len() as u64)
        };
        self.metrics.snapshot(state, window_failures)
    }

    /// Check if circuit is healthy (closed state with low failure rate)
    pub fn is_healthy(&self) -> bool {
        self.metrics().is_healthy()
    }

    fn open(
        &self,
        core: &mut BreakerCore,
        now: Instant,
        reason: TransitionReason,
    ) -> BreakerTransition {
        core.opened_at = Some(now);
        core.failures.clear();
        self.set_state(core, CircuitState::Open, reason)
    }

    fn set_state(
        &self,
        core: &mut BreakerCore,
        to: CircuitState,
        reason: TransitionReason,
    ) -> BreakerTransition {
        let from = core.state;
        core.state = to;
        self.state.store(to as u8, Ordering::Release);
        BreakerTransition {
            connection_id: self.name.clone(),
            from,
            to,
            reason,
        }
    }

    /// Report a transition outside the lock
    fn emit(&self, transition: Option<BreakerTransition>) {
        if let Some(transition) = transition {
            self.telemetry.on_breaker_transition(&transition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingSink;
    use tokio::time::sleep;

    fn config(threshold: u32, cool_down_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            window: Duration::from_secs(10),
            cool_down: Duration::from_millis(cool_down_ms),
        }
    }

    fn transient() -> GatewayError {
        GatewayError::ConnectionReset("peer reset".to_string())
    }

    #[tokio::test]
    async fn test_circuit_breaker_normal_operation() {
        let circuit = CircuitBreaker::new("EMP".to_string(), config(3, 100));
        assert_eq!(circuit.state(), CircuitState::Closed);

        let result = circuit
            .call(|| async { Ok::<_, GatewayError>("success") })
            .await;
        assert!(result.is_ok());

        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_on_failures() {
        let circuit = CircuitBreaker::new("EMP".to_string(), config(2, 100));

        let _ = circuit.call(|| async { Err::<(), _>(transient()) }).await;
        assert_eq!(circuit.state(), CircuitState::Closed);

        let _ = circuit.call(|| async { Err::<(), _>(transient()) }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        let mut executed = false;
        let result = circuit
            .call(|| {
                executed = true;
                async { Ok::<_, GatewayError>("should not execute") }
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert!(!executed);
        assert_eq!(circuit.metrics().rejected_count, 1);
    }

    #[tokio::test]
    async fn test_non_transient_errors_do_not_trip() {
        let circuit = CircuitBreaker::new("MULT".to_string(), config(1, 100));

        for _ in 0..5 {
            let _ = circuit
                .call(|| async { Err::<(), _>(GatewayError::Validation("bad sku".into())) })
                .await;
        }
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().success_count, 5);
    }

    #[tokio::test]
    async fn test_failures_outside_window_are_forgotten() {
        let circuit = CircuitBreaker::new(
            "EMP".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 2,
                window: Duration::from_millis(30),
                cool_down: Duration::from_millis(100),
            },
        );

        let _ = circuit.call(|| async { Err::<(), _>(transient()) }).await;
        sleep(Duration::from_millis(50)).await;
        let _ = circuit.call(|| async { Err::<(), _>(transient()) }).await;

        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().window_failures, 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_recovery() {
        let sink = Arc::new(RecordingSink::default());
        let circuit =
            CircuitBreaker::with_telemetry("EMP".to_string(), config(1, 50), sink.clone());

        let _ = circuit.call(|| async { Err::<(), _>(transient()) }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        sleep(Duration::from_millis(60)).await;

        let result = circuit
            .call(|| async { Ok::<_, GatewayError>("success") })
            .await;
        assert!(result.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().window_failures, 0);

        let states: Vec<_> = sink.transitions().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
    }

    #[tokio::test]
    async fn test_half_open_admits_single_probe() {
        let circuit = CircuitBreaker::new("EMP".to_string(), config(1, 20));
        let _ = circuit.call(|| async { Err::<(), _>(transient()) }).await;
        sleep(Duration::from_millis(30)).await;

        let probe = circuit.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        let second = circuit.try_acquire();
        assert!(matches!(second, Err(GatewayError::CircuitOpen { .. })));

        circuit.record_failure(probe);
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(circuit.try_acquire().is_err());
    }

    #[tokio::test]
    async fn test_abandoned_probe_reopens() {
        let circuit = CircuitBreaker::new("EMP".to_string(), config(1, 20));
        let _ = circuit.call(|| async { Err::<(), _>(transient()) }).await;
        sleep(Duration::from_millis(30)).await;

        let probe = circuit.try_acquire().unwrap();
        drop(probe);
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_force_operations() {
        let circuit = CircuitBreaker::new("EMP".to_string(), config(1, 1_000));

        circuit.force_open();
        assert_eq!(circuit.state(), CircuitState::Open);

        circuit.force_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }
}
