//! Property tests for the backoff schedule and the retry loop's attempt cap

mod common;

use common::strategies::retry_config_strategy;
use erp_gateway::resilience::RetryPolicy;
use erp_gateway::telemetry::NoopSink;
use erp_gateway::GatewayError;
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn base_delay_is_monotone_and_capped(config in retry_config_strategy()) {
        let max = Duration::from_millis(config.max_delay_ms);
        let policy = RetryPolicy::new(config);

        let mut previous = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = policy.base_delay(attempt);
            prop_assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            prop_assert!(delay <= max);
            previous = delay;
        }
    }

    #[test]
    fn jittered_delay_stays_in_band(config in retry_config_strategy(), seed in any::<u64>()) {
        let max = Duration::from_millis(config.max_delay_ms);
        let factor = if config.jitter_enabled { config.jitter_factor } else { 0.0 };
        let policy = RetryPolicy::with_seed(config, seed);
        let slack = Duration::from_millis(1);

        for attempt in 1..=6 {
            let base = policy.base_delay(attempt);
            let delay = policy.delay_for_attempt(attempt);
            let low = base.mul_f64(1.0 - factor);
            let high = base.mul_f64(1.0 + factor).min(max);
            prop_assert!(delay + slack >= low, "{delay:?} below {low:?}");
            prop_assert!(delay <= high + slack, "{delay:?} above {high:?}");
            prop_assert!(delay <= max);
        }
    }

    #[test]
    fn transient_failures_never_exceed_attempt_budget(config in retry_config_strategy()) {
        let max_attempts = config.max_attempts;
        let policy = RetryPolicy::new(config);
        let calls = AtomicU32::new(0);

        let outcome = paused_runtime().block_on(policy.execute("EMP", None, &NoopSink, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(GatewayError::ConnectionReset("reset".into())) }
        }));

        prop_assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
        prop_assert_eq!(outcome.attempts, max_attempts);
        let exhausted = matches!(
            outcome.result,
            Err(GatewayError::MaxRetriesExceeded { attempts, .. }) if attempts == max_attempts
        );
        prop_assert!(exhausted);
    }

    #[test]
    fn permanent_failures_are_never_retried(config in retry_config_strategy()) {
        let policy = RetryPolicy::new(config);
        let calls = AtomicU32::new(0);

        let outcome = paused_runtime().block_on(policy.execute("MULT", None, &NoopSink, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(GatewayError::MalformedQuery("near 'FORM'".into())) }
        }));

        prop_assert_eq!(calls.load(Ordering::SeqCst), 1);
        prop_assert!(matches!(outcome.result, Err(GatewayError::MalformedQuery(_))));
    }
}

#[tokio::test(start_paused = true)]
async fn test_success_after_retries_reports_retry_count() {
    let policy = RetryPolicy::new(erp_gateway::test_utils::test_config().retry);
    let calls = AtomicU32::new(0);

    let outcome = policy
        .execute("EMP", None, &NoopSink, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 1 {
                    Err(GatewayError::PoolExhausted("busy".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

    assert_eq!(*outcome.result.as_ref().unwrap(), 2);
    assert_eq!(outcome.retries(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
