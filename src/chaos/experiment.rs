//! Chaos experiment definitions and their counters.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Fault applied when an experiment triggers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FaultType {
    /// Sleep a random duration in `[min_ms, max_ms]`, then run the call
    Latency { min_ms: u64, max_ms: u64 },
    /// Sleep `delay_ms`, then fail with a timeout
    Timeout { delay_ms: u64 },
    /// Fail immediately with a transient connection error
    Error { message: String },
    /// Fail immediately as if no pooled connection were available
    PoolExhaustion,
    /// Sleep `delay_ms`, then run the call
    SlowQuery { delay_ms: u64 },
}

impl FaultType {
    pub fn label(&self) -> &'static str {
        match self {
            FaultType::Latency { .. } => "latency",
            FaultType::Timeout { .. } => "timeout",
            FaultType::Error { .. } => "error",
            FaultType::PoolExhaustion => "pool_exhaustion",
            FaultType::SlowQuery { .. } => "slow_query",
        }
    }
}

/// A named fault-injection rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosExperiment {
    pub name: String,
    pub fault: FaultType,
    /// Chance in `[0.0, 1.0]` that a guarded call triggers the fault
    pub probability: f64,
    /// Connection ids this experiment applies to; empty means every connection
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ChaosExperiment {
    /// New experiment that always triggers on every connection
    pub fn new(name: impl Into<String>, fault: FaultType) -> Self {
        Self {
            name: name.into(),
            fault,
            probability: 1.0,
            targets: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability;
        self
    }

    pub fn targeting<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn applies_to(&self, connection_id: &str) -> bool {
        self.targets.is_empty() || self.targets.iter().any(|t| t == connection_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::Validation(
                "chaos experiment name must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.probability) {
            return Err(GatewayError::Validation(format!(
                "chaos experiment '{}': probability {} outside [0.0, 1.0]",
                self.name, self.probability
            )));
        }
        if let FaultType::Latency { min_ms, max_ms } = self.fault {
            if min_ms > max_ms {
                return Err(GatewayError::Validation(format!(
                    "chaos experiment '{}': latency min_ms {min_ms} exceeds max_ms {max_ms}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Counters reported by the admin surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExperimentStats {
    pub name: String,
    pub fault: &'static str,
    pub enabled: bool,
    /// Guarded calls this experiment evaluated
    pub calls_observed: u64,
    /// Calls on which the fault was applied
    pub triggered: u64,
}

/// Experiment plus its live counters
#[derive(Debug)]
pub(crate) struct RegisteredExperiment {
    pub(crate) definition: ChaosExperiment,
    pub(crate) enabled: AtomicBool,
    pub(crate) calls_observed: AtomicU64,
    pub(crate) triggered: AtomicU64,
}

impl RegisteredExperiment {
    pub(crate) fn new(definition: ChaosExperiment) -> Self {
        Self {
            enabled: AtomicBool::new(definition.enabled),
            definition,
            calls_observed: AtomicU64::new(0),
            triggered: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn snapshot(&self) -> ChaosExperiment {
        ChaosExperiment {
            enabled: self.is_enabled(),
            ..self.definition.clone()
        }
    }

    pub(crate) fn stats(&self) -> ExperimentStats {
        ExperimentStats {
            name: self.definition.name.clone(),
            fault: self.definition.fault.label(),
            enabled: self.is_enabled(),
            calls_observed: self.calls_observed.load(Ordering::Relaxed),
            triggered: self.triggered.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.calls_observed.store(0, Ordering::Relaxed);
        self.triggered.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(ChaosExperiment::new("ok", FaultType::PoolExhaustion)
            .validate()
            .is_ok());
        assert!(ChaosExperiment::new("p", FaultType::PoolExhaustion)
            .with_probability(1.5)
            .validate()
            .is_err());
        assert!(ChaosExperiment::new(
            "latency",
            FaultType::Latency {
                min_ms: 50,
                max_ms: 10
            }
        )
        .validate()
        .is_err());
        assert!(ChaosExperiment::new(" ", FaultType::PoolExhaustion)
            .validate()
            .is_err());
    }

    #[test]
    fn test_targeting() {
        let everywhere = ChaosExperiment::new("all", FaultType::PoolExhaustion);
        assert!(everywhere.applies_to("EMP"));
        assert!(everywhere.applies_to("MULT"));

        let mult_only = everywhere.clone().targeting(["MULT"]);
        assert!(!mult_only.applies_to("EMP"));
        assert!(mult_only.applies_to("MULT"));
    }

    #[test]
    fn test_fault_deserializes_tagged() {
        let experiment: ChaosExperiment = serde_json::from_str(
            r#"{"name":"flaky-emp","fault":{"type":"error","message":"boom"},"probability":0.5,"targets":["EMP"]}"#,
        )
        .unwrap();
        assert_eq!(
            experiment.fault,
            FaultType::Error {
                message: "boom".to_string()
            }
        );
        assert!(experiment.enabled);
    }
}
