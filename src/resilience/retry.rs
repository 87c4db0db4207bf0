//! # Retry Policy
//!
//! Exponential backoff with jitter for transient ERP failures, plus the
//! sequential retry loop used by the connection manager.
//!
//! | Attempt failed | Base delay (100ms initial, x2) |
//! |----------------|--------------------------------|
//! | 1              | 100ms                          |
//! | 2              | 200ms                          |
//! | 3              | 400ms                          |
//! | n              | min(max_delay, 100ms * 2^(n-1)) |
//!
//! Jitter then scales the base delay by `1 ± jitter_factor * r` and the
//! result is clamped to `max_delay` again.

use crate::config::RetryConfig;
use crate::error::{GatewayError, Result};
use crate::telemetry::{RetryEvent, TelemetrySink};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again
    Retry(Duration),
    /// Non-retryable error; surface it unchanged
    Abort,
    /// Attempt budget spent; wrap in `MaxRetriesExceeded`
    Exhausted,
}

/// Progress of one retry loop
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempts made so far (1-based once the first attempt starts)
    pub attempt: u32,
    pub max_attempts: u32,
    pub started: Instant,
    pub deadline: Option<Instant>,
    pub last_error: Option<GatewayError>,
}

impl RetryContext {
    pub fn new(max_attempts: u32, deadline: Option<Instant>) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            started: Instant::now(),
            deadline,
            last_error: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the caller deadline, if one was set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Result of a retry loop together with the attempt count
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl<T> RetryOutcome<T> {
    /// Attempts beyond the first
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Backoff computation and retry loop executor
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    rng: Mutex<fastrand::Rng>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Policy with a fixed jitter seed for reproducible schedules
    pub fn with_seed(config: RetryConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Un-jittered delay after the given failed attempt (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_ms = self.config.max_delay_ms as f64;
        let raw_ms = self.config.initial_delay_ms as f64 * self.config.backoff_factor.powi(exponent);
        Duration::from_millis(raw_ms.min(max_ms) as u64)
    }

    /// Delay after the given failed attempt, with jitter applied
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.config.jitter_enabled || self.config.jitter_factor <= 0.0 {
            return base;
        }

        let r = self.rng.lock().f64() * 2.0 - 1.0;
        let scaled = base.as_secs_f64() * (1.0 + self.config.jitter_factor * r);
        let max = Duration::from_millis(self.config.max_delay_ms);
        Duration::from_secs_f64(scaled.max(0.0)).min(max)
    }

    /// Classify a failed attempt
    pub fn decide(&self, error: &GatewayError, attempt: u32) -> RetryDecision {
        if !error.is_retryable() {
            RetryDecision::Abort
        } else if attempt >= self.config.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry(self.delay_for_attempt(attempt))
        }
    }

    /// Run `operation` until it succeeds, fails permanently, exhausts the
    /// attempt budget, or the deadline passes.
    ///
    /// Attempts run strictly one after another. A backoff sleep that would
    /// cross the deadline ends the loop with `Timeout` instead of sleeping.
    pub async fn execute<T, F, Fut>(
        &self,
        connection_id: &str,
        deadline: Option<Instant>,
        telemetry: &dyn TelemetrySink,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut ctx = RetryContext::new(self.config.max_attempts, deadline);

        loop {
            ctx.attempt += 1;
            let attempt = operation(ctx.attempt);
            let result = match ctx.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, attempt).await {
                    Ok(result) => result,
                    Err(_) => {
                        return self.finish(
                            &ctx,
                            Err(GatewayError::Timeout(format!(
                                "{connection_id}: deadline exceeded during attempt {}",
                                ctx.attempt
                            ))),
                        )
                    }
                },
                None => attempt.await,
            };

            let error = match result {
                Ok(value) => return self.finish(&ctx, Ok(value)),
                Err(error) => error,
            };

            match self.decide(&error, ctx.attempt) {
                RetryDecision::Abort => return self.finish(&ctx, Err(error)),
                RetryDecision::Exhausted => {
                    let attempts = ctx.attempt;
                    return self.finish(
                        &ctx,
                        Err(GatewayError::MaxRetriesExceeded {
                            attempts,
                            source: Box::new(error),
                        }),
                    );
                }
                RetryDecision::Retry(delay) => {
                    if let Some(remaining) = ctx.remaining() {
                        if delay >= remaining {
                            return self.finish(
                                &ctx,
                                Err(GatewayError::Timeout(format!(
                                    "{connection_id}: deadline would pass during backoff after attempt {} ({error})",
                                    ctx.attempt
                                ))),
                            );
                        }
                    }

                    debug!(
                        connection_id,
                        attempt = ctx.attempt,
                        max_attempts = ctx.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, backing off"
                    );
                    telemetry.on_retry(&RetryEvent {
                        connection_id: connection_id.to_string(),
                        attempt: ctx.attempt,
                        delay,
                        error: error.to_string(),
                    });
                    ctx.last_error = Some(error);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn finish<T>(&self, ctx: &RetryContext, result: Result<T>) -> RetryOutcome<T> {
        RetryOutcome {
            result,
            attempts: ctx.attempt,
            elapsed: ctx.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::NoopSink;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 5,
            max_delay_ms: 40,
            backoff_factor: 2.0,
            jitter_enabled: false,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_enabled: false,
            ..RetryConfig::default()
        });

        let delays: Vec<u64> = (1..=6)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_jitter_stays_in_band_and_capped() {
        let policy = RetryPolicy::with_seed(
            RetryConfig {
                initial_delay_ms: 100,
                max_delay_ms: 300,
                jitter_enabled: true,
                jitter_factor: 0.25,
                ..RetryConfig::default()
            },
            42,
        );

        for _ in 0..200 {
            let first = policy.delay_for_attempt(1);
            assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));

            let capped = policy.delay_for_attempt(8);
            assert!(capped <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::new(fast_config());
        let transient = GatewayError::Timeout("slow".into());

        assert!(matches!(policy.decide(&transient, 1), RetryDecision::Retry(_)));
        assert_eq!(policy.decide(&transient, 3), RetryDecision::Exhausted);
        assert_eq!(
            policy.decide(&GatewayError::NotFound("item".into()), 1),
            RetryDecision::Abort
        );
    }

    #[tokio::test]
    async fn test_execute_recovers_after_transient_failures() {
        let policy = RetryPolicy::new(fast_config());
        let calls = AtomicU32::new(0);

        let outcome = policy
            .execute("EMP", None, &NoopSink, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(GatewayError::ConnectionReset("reset".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(*outcome.result.as_ref().unwrap(), 3);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retries(), 2);
    }

    #[tokio::test]
    async fn test_execute_wraps_exhaustion() {
        let policy = RetryPolicy::new(fast_config());

        let outcome: RetryOutcome<()> = policy
            .execute("MULT", None, &NoopSink, |_| async {
                Err(GatewayError::PoolExhausted("busy".into()))
            })
            .await;

        match outcome.result {
            Err(GatewayError::MaxRetriesExceeded { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, GatewayError::PoolExhausted(_)));
            }
            other => panic!("expected MaxRetriesExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_aborts_on_permanent_error() {
        let policy = RetryPolicy::new(fast_config());
        let calls = AtomicU32::new(0);

        let outcome: RetryOutcome<()> = policy
            .execute("EMP", None, &NoopSink, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::Authentication("bad password".into())) }
            })
            .await;

        assert!(matches!(outcome.result, Err(GatewayError::Authentication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backoff_past_deadline_times_out() {
        let policy = RetryPolicy::new(RetryConfig {
            initial_delay_ms: 500,
            max_delay_ms: 500,
            ..fast_config()
        });
        let deadline = Instant::now() + Duration::from_millis(50);
        let started = std::time::Instant::now();

        let outcome: RetryOutcome<()> = policy
            .execute("EMP", Some(deadline), &NoopSink, |_| async {
                Err(GatewayError::Timeout("slow".into()))
            })
            .await;

        assert!(matches!(outcome.result, Err(GatewayError::Timeout(_))));
        assert_eq!(outcome.attempts, 1);
        assert!(started.elapsed() < Duration::from_millis(400));
    }
}
