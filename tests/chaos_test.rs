//! Fault injection driven through the connection manager

mod common;

use common::TestGateway;
use erp_gateway::test_utils::{test_config, ScriptedDriver};
use erp_gateway::{ChaosExperiment, FaultType, GatewayError, LogicalDb, ManagerMode};
use std::time::Duration;
use tokio_test::assert_ok;

fn chaos_gateway() -> TestGateway {
    let mut config = test_config();
    config.chaos.enabled = true;
    config.chaos.seed = Some(7);
    TestGateway::with_config(config)
}

#[tokio::test]
async fn test_error_experiment_exhausts_retries_on_target_only() {
    let gw = chaos_gateway();
    assert_eq!(gw.manager.initialize().await.unwrap(), ManagerMode::Normal);

    let injector = gw.manager.fault_injector().expect("chaos enabled").clone();
    injector
        .register_experiment(
            ChaosExperiment::new(
                "emp-outage",
                FaultType::Error {
                    message: "injected network partition".into(),
                },
            )
            .with_probability(1.0)
            .targeting(["EMP"]),
        )
        .unwrap();

    let err = gw
        .manager
        .execute(LogicalDb::Emp, "SELECT Descr FROM Items WHERE ItemID = ?", &["7530110".into()])
        .await
        .unwrap_err();
    match err {
        GatewayError::MaxRetriesExceeded { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*source, GatewayError::Connection(_)));
        }
        other => panic!("expected MaxRetriesExceeded, got {other:?}"),
    }
    assert_eq!(gw.sink.retries().len(), 2);

    assert_ok!(gw.manager.execute(LogicalDb::Mult, "SELECT 1", &[]).await);

    let stats = injector.experiment_stats("emp-outage").unwrap();
    assert!(stats.triggered >= 3);
    assert_eq!(stats.fault, "error");
}

#[tokio::test]
async fn test_stopping_experiment_restores_service() {
    let gw = chaos_gateway();
    gw.manager.initialize().await.unwrap();
    let injector = gw.manager.fault_injector().unwrap().clone();
    injector
        .register_experiment(ChaosExperiment::new("exhaust", FaultType::PoolExhaustion))
        .unwrap();

    let err = gw.manager.execute(LogicalDb::Mult, "SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::MaxRetriesExceeded { ref source, .. } if matches!(**source, GatewayError::PoolExhausted(_))
    ));

    injector.stop_experiment("exhaust").unwrap();
    assert_ok!(gw.manager.execute(LogicalDb::Mult, "SELECT 1", &[]).await);

    let listed = injector.list_experiments();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].enabled);

    injector.remove_experiment("exhaust").unwrap();
    assert!(injector.list_experiments().is_empty());
    assert!(matches!(
        injector.remove_experiment("exhaust"),
        Err(GatewayError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_latency_experiment_delays_but_succeeds() {
    let gw = chaos_gateway();
    gw.manager.initialize().await.unwrap();
    gw.manager
        .fault_injector()
        .unwrap()
        .register_experiment(ChaosExperiment::new(
            "jitter",
            FaultType::Latency { min_ms: 20, max_ms: 30 },
        ))
        .unwrap();

    let started = std::time::Instant::now();
    assert_ok!(gw.manager.execute(LogicalDb::Emp, "SELECT 1", &[]).await);
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[tokio::test]
async fn test_disabled_injector_is_transparent() {
    let gw = chaos_gateway();
    gw.manager.initialize().await.unwrap();
    let injector = gw.manager.fault_injector().unwrap().clone();
    injector
        .register_experiment(ChaosExperiment::new(
            "always-fail",
            FaultType::Error { message: "boom".into() },
        ))
        .unwrap();
    injector.disable();

    assert_ok!(gw.manager.execute(LogicalDb::Emp, "SELECT 1", &[]).await);
    assert_eq!(injector.experiment_stats("always-fail").unwrap().calls_observed, 0);

    injector.enable();
    assert!(gw.manager.execute(LogicalDb::Emp, "SELECT 1", &[]).await.is_err());
    let all = injector.all_stats();
    assert_eq!(all.len(), 1);
    assert!(all[0].triggered >= 1);
}

#[tokio::test]
async fn test_startup_faults_put_manager_in_degraded_mode() {
    let mut config = test_config();
    config.chaos.enabled = true;
    let injector = std::sync::Arc::new(erp_gateway::FaultInjector::from_config(&config.chaos));
    injector
        .register_experiment(
            ChaosExperiment::new("boot-timeout", FaultType::Timeout { delay_ms: 1 }).targeting(["MULT"]),
        )
        .unwrap();

    let driver = ScriptedDriver::new();
    let manager = erp_gateway::ConnectionManager::builder(config)
        .driver(std::sync::Arc::new(driver))
        .fault_injector(injector)
        .build()
        .unwrap();

    assert_eq!(manager.initialize().await.unwrap(), ManagerMode::Degraded);
    let result = manager.execute(LogicalDb::Emp, "SELECT 1", &[]).await.unwrap();
    assert_eq!(result.len(), 1);
}
