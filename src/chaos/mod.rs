//! # Chaos Fault Injection
//!
//! Named experiments that inject latency, timeouts, errors, pool exhaustion
//! or slow queries into driver calls, used to exercise the retry and circuit
//! breaker paths against a live gateway.
//!
//! The injector is only installed in front of the driver when
//! `chaos.enabled` is set; otherwise the driver is used undecorated.
//!
//! ```rust,no_run
//! use erp_gateway::chaos::{ChaosExperiment, FaultInjector, FaultType};
//!
//! # fn example() -> erp_gateway::error::Result<()> {
//! let injector = FaultInjector::with_seed(42);
//! injector.register_experiment(
//!     ChaosExperiment::new("mult-flaky", FaultType::Error { message: "injected".into() })
//!         .with_probability(0.25)
//!         .targeting(["MULT"]),
//! )?;
//! injector.enable();
//! # Ok(())
//! # }
//! ```

pub mod experiment;
pub mod injector;

pub use experiment::{ChaosExperiment, ExperimentStats, FaultType};
pub use injector::{ChaosDriver, FaultInjector};
