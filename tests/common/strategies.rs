use erp_gateway::config::RetryConfig;
use proptest::prelude::*;

/// Strategy for valid retry configurations, jitter included
pub fn retry_config_strategy() -> impl Strategy<Value = RetryConfig> {
    (
        1u32..8,
        1u64..500,
        1.0f64..4.0,
        0u64..5_000,
        any::<bool>(),
        0.0f64..=1.0,
    )
        .prop_map(
            |(max_attempts, initial_delay_ms, backoff_factor, extra_ms, jitter_enabled, jitter_factor)| {
                RetryConfig {
                    max_attempts,
                    initial_delay_ms,
                    max_delay_ms: initial_delay_ms + extra_ms,
                    backoff_factor,
                    jitter_enabled,
                    jitter_factor,
                }
            },
        )
}

/// Strategy for cache keys shaped like `family:id`
pub fn cache_key_strategy() -> impl Strategy<Value = String> {
    ("(item|vendor|ledger)", "[0-9]{1,8}").prop_map(|(family, id)| format!("{family}:{id}"))
}
