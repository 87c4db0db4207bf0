//! The shipped configuration files load and validate in every environment

use erp_gateway::config::{ConfigManager, L2Backend};
use erp_gateway::database::DriverKind;
use std::path::PathBuf;

fn shipped_config_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config")
}

#[test]
fn test_every_shipped_environment_validates() {
    for environment in ["development", "test", "production"] {
        let manager =
            ConfigManager::load_from_directory_with_env(Some(shipped_config_dir()), environment)
                .unwrap_or_else(|e| panic!("{environment}: {e}"));
        assert_eq!(manager.environment(), environment);
        assert_eq!(manager.config().driver, DriverKind::Tds);
    }
}

#[test]
fn test_overlays_apply_on_top_of_base() {
    let test = ConfigManager::load_from_directory_with_env(Some(shipped_config_dir()), "test").unwrap();
    let config = test.config();
    assert_eq!(config.query_cache.l2.backend, L2Backend::Memory);
    assert_eq!(config.query_cache.l2.key_prefix, "test:");
    assert!(!config.retry.jitter_enabled);
    assert_eq!(config.chaos.seed, Some(42));
    // Untouched by the overlay
    assert_eq!(config.databases.emp.database, "EMP");
    assert_eq!(config.startup.probe_query, "SELECT 1");

    let production =
        ConfigManager::load_from_directory_with_env(Some(shipped_config_dir()), "production").unwrap();
    assert_eq!(production.config().databases.emp.pool.max_connections, 20);
    assert_eq!(production.config().query_cache.l2.backend, L2Backend::Redis);
}

#[test]
fn test_debug_config_masks_secrets() {
    let manager =
        ConfigManager::load_from_directory_with_env(Some(shipped_config_dir()), "production").unwrap();
    let debug = manager.debug_config();
    let url = debug["query_cache"]["l2"]["url"].as_str().unwrap();
    assert!(url.starts_with("[MASKED"));
    assert_eq!(debug["databases"]["emp"]["password"], "[EMPTY]");
}

#[test]
fn test_cache_component_breaker_override() {
    let manager =
        ConfigManager::load_from_directory_with_env(Some(shipped_config_dir()), "development").unwrap();
    let breakers = &manager.config().circuit_breakers;
    assert_eq!(breakers.config_for_component("cache").failure_threshold, 3);
    assert_eq!(breakers.config_for_component("EMP").failure_threshold, 5);
}
