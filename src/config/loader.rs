//! Configuration Loader
//!
//! Environment-aware configuration loading. Handles file discovery,
//! environment detection, layered merging through the `config` crate, and
//! sanitized logging of the result.

use super::error::{ConfigResult, ConfigurationError};
use super::GatewayConfig;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE_NAME: &str = "erp-gateway.toml";
const ENV_PREFIX: &str = "ERP_GATEWAY";

/// Loaded, validated configuration plus the context it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: GatewayConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Useful for testing without modifying global environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        if !config_directory.is_dir() {
            return Err(ConfigurationError::DirectoryNotFound {
                path: config_directory,
            });
        }

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        debug!(
            "Configuration loaded successfully: {}",
            serde_json::to_string_pretty(&Self::sanitize_config_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );

        info!(
            environment = environment,
            driver = %config.driver,
            emp_endpoint = %config.databases.emp.endpoint_label(config.driver),
            mult_endpoint = %config.databases.mult.endpoint_label(config.driver),
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration (tests, embedding)
    pub fn from_config(config: GatewayConfig, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Sanitized configuration for debugging that masks sensitive fields
    pub fn debug_config(&self) -> serde_json::Value {
        Self::sanitize_config_for_logging(&self.config)
    }

    /// Detect the current environment from process variables
    pub fn detect_environment() -> String {
        env::var("ERP_GATEWAY_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("ERP_GATEWAY_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    /// Merge base file, environment overlay and environment variables
    fn load_and_merge_config(config_dir: &Path, environment: &str) -> ConfigResult<GatewayConfig> {
        let base_path = config_dir.join(BASE_FILE_NAME);
        let overlay_path = config_dir.join(format!("erp-gateway-{environment}.toml"));

        debug!(
            base = %base_path.display(),
            overlay = %overlay_path.display(),
            base_exists = base_path.exists(),
            overlay_exists = overlay_path.exists(),
            "Resolving configuration sources"
        );

        let settings = config::Config::builder()
            .add_source(config::File::from(base_path).required(false))
            .add_source(config::File::from(overlay_path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        settings
            .try_deserialize::<GatewayConfig>()
            .map_err(|e| ConfigurationError::load_error(environment, e))
    }

    /// Sanitize configuration for safe logging by masking sensitive fields
    fn sanitize_config_for_logging(config: &GatewayConfig) -> serde_json::Value {
        let mut config_json = serde_json::to_value(config).unwrap_or(serde_json::Value::Null);
        let sensitive_patterns = ["password", "secret", "token", "credential", "dsn", "url"];
        Self::sanitize_json_recursive(&mut config_json, &sensitive_patterns);
        config_json
    }

    /// Recursively sanitize sensitive fields in JSON configuration
    fn sanitize_json_recursive(value: &mut serde_json::Value, sensitive_patterns: &[&str]) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    let is_sensitive = sensitive_patterns
                        .iter()
                        .any(|pattern| key_lower.contains(pattern));

                    if is_sensitive {
                        if let serde_json::Value::String(s) = val {
                            *val = serde_json::Value::String(mask_value(s));
                        } else if !val.is_null() {
                            *val = serde_json::Value::String("[MASKED]".to_string());
                        }
                    } else {
                        Self::sanitize_json_recursive(val, sensitive_patterns);
                    }
                }
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    Self::sanitize_json_recursive(item, sensitive_patterns);
                }
            }
            _ => {}
        }
    }
}

/// Show only the first and last two characters of a secret
fn mask_value(s: &str) -> String {
    if s.is_empty() {
        return "[EMPTY]".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 4 {
        let head: String = chars[..2].iter().collect();
        let tail: String = chars[chars.len() - 2..].iter().collect();
        format!("[MASKED: {head}***{tail}]")
    } else {
        "[MASKED: ***]".to_string()
    }
}
