//! # OpenTelemetry Metrics
//!
//! Counters and histograms for the database-access core, recorded through
//! the global meter provider. Installing an exporter is the embedding
//! application's job; without one these instruments are no-ops.
//!
//! Instruments:
//! - `erp_gateway.queries.total` (db, operation, result)
//! - `erp_gateway.query.duration` ms histogram (db, operation, result)
//! - `erp_gateway.query.retries` histogram (db)
//! - `erp_gateway.breaker.transitions.total` (connection_id, to, reason)
//! - `erp_gateway.cache.events.total` (tier, outcome)
//! - `erp_gateway.retries.total` (connection_id)

use super::{BreakerTransition, CacheEvent, QueryEvent, RetryEvent, TelemetrySink};
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static GATEWAY_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    GATEWAY_METER.get_or_init(|| opentelemetry::global::meter("erp-gateway"))
}

/// Sink that records events as OpenTelemetry instruments
#[derive(Debug, Clone)]
pub struct OtelMetricsSink {
    queries_total: Counter<u64>,
    query_duration: Histogram<f64>,
    query_retries: Histogram<u64>,
    breaker_transitions: Counter<u64>,
    cache_events: Counter<u64>,
    retries_total: Counter<u64>,
}

impl OtelMetricsSink {
    pub fn new() -> Self {
        let meter = meter();
        Self {
            queries_total: meter
                .u64_counter("erp_gateway.queries.total")
                .with_description("Total number of ERP queries executed")
                .build(),
            query_duration: meter
                .f64_histogram("erp_gateway.query.duration")
                .with_description("End-to-end ERP query duration including retries")
                .with_unit("ms")
                .build(),
            query_retries: meter
                .u64_histogram("erp_gateway.query.retries")
                .with_description("Retries needed per ERP query")
                .build(),
            breaker_transitions: meter
                .u64_counter("erp_gateway.breaker.transitions.total")
                .with_description("Circuit breaker state transitions")
                .build(),
            cache_events: meter
                .u64_counter("erp_gateway.cache.events.total")
                .with_description("Query cache events by tier and outcome")
                .build(),
            retries_total: meter
                .u64_counter("erp_gateway.retries.total")
                .with_description("Backoff retries scheduled")
                .build(),
        }
    }
}

impl Default for OtelMetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for OtelMetricsSink {
    fn on_query(&self, event: &QueryEvent) {
        let result = if event.degraded {
            "degraded"
        } else if event.success {
            "success"
        } else {
            "error"
        };
        let labels = [
            KeyValue::new("db", event.db.connection_id()),
            KeyValue::new("operation", event.operation),
            KeyValue::new("result", result),
        ];
        self.queries_total.add(1, &labels);
        self.query_duration
            .record(event.duration.as_secs_f64() * 1000.0, &labels);
        self.query_retries.record(
            u64::from(event.retries),
            &[KeyValue::new("db", event.db.connection_id())],
        );
    }

    fn on_breaker_transition(&self, event: &BreakerTransition) {
        self.breaker_transitions.add(
            1,
            &[
                KeyValue::new("connection_id", event.connection_id.clone()),
                KeyValue::new("to", format!("{:?}", event.to)),
                KeyValue::new("reason", event.reason.as_str()),
            ],
        );
    }

    fn on_cache(&self, event: &CacheEvent) {
        self.cache_events.add(
            1,
            &[
                KeyValue::new("tier", event.tier.as_str()),
                KeyValue::new("outcome", event.outcome.as_str()),
            ],
        );
    }

    fn on_retry(&self, event: &RetryEvent) {
        self.retries_total.add(
            1,
            &[KeyValue::new("connection_id", event.connection_id.clone())],
        );
    }
}
