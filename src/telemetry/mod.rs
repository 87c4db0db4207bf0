//! # Telemetry Sink Surface
//!
//! Events emitted by the database-access core. Exporters live outside the
//! crate and consume these through [`TelemetrySink`]:
//!
//! - [`QueryEvent`] once per `execute` call, after retries settle
//! - [`BreakerTransition`] on every circuit state change
//! - [`CacheEvent`] for hits, misses, writes, invalidations and tier errors
//! - [`RetryEvent`] before each backoff sleep
//!
//! Sinks must be cheap and non-blocking; they run inline on the calling task.

pub mod metrics;

use crate::config::TelemetryConfig;
use crate::database::LogicalDb;
use crate::logging::log_query_operation;
use crate::resilience::CircuitState;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use metrics::OtelMetricsSink;

/// Outcome of one `execute` call
#[derive(Debug, Clone, Serialize)]
pub struct QueryEvent {
    pub db: LogicalDb,
    /// Leading statement keyword (`select`, `update`, `procedure`, ...)
    pub operation: &'static str,
    pub duration: Duration,
    pub success: bool,
    /// Attempts beyond the first
    pub retries: u32,
    pub error: Option<String>,
    /// Served from the degraded-mode mock instead of the ERP
    pub degraded: bool,
}

/// Why a breaker changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    FailureThreshold,
    CoolDownElapsed,
    ProbeSucceeded,
    ProbeFailed,
    ProbeAbandoned,
    ForcedOpen,
    ForcedClosed,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionReason::FailureThreshold => "failure_threshold",
            TransitionReason::CoolDownElapsed => "cool_down_elapsed",
            TransitionReason::ProbeSucceeded => "probe_succeeded",
            TransitionReason::ProbeFailed => "probe_failed",
            TransitionReason::ProbeAbandoned => "probe_abandoned",
            TransitionReason::ForcedOpen => "forced_open",
            TransitionReason::ForcedClosed => "forced_closed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerTransition {
    pub connection_id: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: TransitionReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    L1,
    L2,
    Origin,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::L1 => "l1",
            CacheTier::L2 => "l2",
            CacheTier::Origin => "origin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
    Write,
    Invalidate,
    /// Caller joined an origin fetch already in flight
    Coalesced,
    Error,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::Write => "write",
            CacheOutcome::Invalidate => "invalidate",
            CacheOutcome::Coalesced => "coalesced",
            CacheOutcome::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEvent {
    pub tier: CacheTier,
    pub outcome: CacheOutcome,
    pub key: String,
}

impl CacheEvent {
    pub fn new(tier: CacheTier, outcome: CacheOutcome, key: impl Into<String>) -> Self {
        Self {
            tier,
            outcome,
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryEvent {
    pub connection_id: String,
    /// Attempt that just failed (1-based)
    pub attempt: u32,
    pub delay: Duration,
    pub error: String,
}

/// Receiver for core telemetry
pub trait TelemetrySink: Send + Sync + Debug {
    fn on_query(&self, event: &QueryEvent);

    fn on_breaker_transition(&self, event: &BreakerTransition);

    fn on_cache(&self, event: &CacheEvent);

    fn on_retry(&self, _event: &RetryEvent) {}
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn on_query(&self, _event: &QueryEvent) {}
    fn on_breaker_transition(&self, _event: &BreakerTransition) {}
    fn on_cache(&self, _event: &CacheEvent) {}
}

/// Writes every event as a structured tracing record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn on_query(&self, event: &QueryEvent) {
        let duration_ms = event.duration.as_millis() as u64;
        if event.success {
            debug!(
                db = %event.db,
                operation = event.operation,
                duration_ms,
                retries = event.retries,
                degraded = event.degraded,
                "ERP query completed"
            );
        } else {
            log_query_operation(
                event.db.connection_id(),
                event.operation,
                "failed",
                Some(duration_ms),
                event.retries,
                event.error.as_deref(),
            );
        }
    }

    fn on_breaker_transition(&self, event: &BreakerTransition) {
        info!(
            connection_id = %event.connection_id,
            from = ?event.from,
            to = ?event.to,
            reason = event.reason.as_str(),
            "Circuit breaker transition"
        );
    }

    fn on_cache(&self, event: &CacheEvent) {
        if event.outcome == CacheOutcome::Error {
            warn!(
                tier = event.tier.as_str(),
                key = %event.key,
                "Cache tier error"
            );
        } else {
            debug!(
                tier = event.tier.as_str(),
                outcome = event.outcome.as_str(),
                key = %event.key,
                "Cache event"
            );
        }
    }

    fn on_retry(&self, event: &RetryEvent) {
        debug!(
            connection_id = %event.connection_id,
            attempt = event.attempt,
            delay_ms = event.delay.as_millis() as u64,
            error = %event.error,
            "Retrying ERP operation"
        );
    }
}

/// Fans every event out to several sinks in order
#[derive(Debug, Default, Clone)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TelemetrySink for CompositeSink {
    fn on_query(&self, event: &QueryEvent) {
        for sink in &self.sinks {
            sink.on_query(event);
        }
    }

    fn on_breaker_transition(&self, event: &BreakerTransition) {
        for sink in &self.sinks {
            sink.on_breaker_transition(event);
        }
    }

    fn on_cache(&self, event: &CacheEvent) {
        for sink in &self.sinks {
            sink.on_cache(event);
        }
    }

    fn on_retry(&self, event: &RetryEvent) {
        for sink in &self.sinks {
            sink.on_retry(event);
        }
    }
}

/// Build the sink stack selected by configuration
pub fn sink_from_config(config: &TelemetryConfig) -> Arc<dyn TelemetrySink> {
    let mut composite = CompositeSink::default();
    if config.tracing_events {
        composite.push(Arc::new(TracingSink));
    }
    if config.otel_metrics {
        composite.push(Arc::new(OtelMetricsSink::new()));
    }
    match composite.len() {
        0 => Arc::new(NoopSink),
        _ => Arc::new(composite),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingSink;

    #[test]
    fn test_composite_fans_out() {
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let composite = CompositeSink::new(vec![first.clone(), second.clone()]);

        composite.on_cache(&CacheEvent::new(CacheTier::L1, CacheOutcome::Hit, "item:1"));
        composite.on_breaker_transition(&BreakerTransition {
            connection_id: "EMP".to_string(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            reason: TransitionReason::FailureThreshold,
        });

        for sink in [&first, &second] {
            assert_eq!(sink.cache_events().len(), 1);
            assert_eq!(sink.transitions().len(), 1);
        }
    }

    #[test]
    fn test_sink_from_config_selection() {
        let none = sink_from_config(&TelemetryConfig {
            tracing_events: false,
            otel_metrics: false,
        });
        assert!(format!("{none:?}").contains("NoopSink"));

        let tracing_only = sink_from_config(&TelemetryConfig::default());
        assert!(format!("{tracing_only:?}").contains("TracingSink"));
    }
}
