//! # ERP Gateway Configuration Validator
//!
//! Command-line tool for validating gateway configuration files across
//! environments before the connection manager ever opens a socket.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use erp_gateway::config::{ConfigManager, GatewayConfig, L2Backend};
use erp_gateway::database::{DriverKind, LogicalDb};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate ERP gateway configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production, ...)
    #[arg(short, long, env = "ERP_GATEWAY_ENV", default_value = "development")]
    environment: String,

    /// Configuration directory path (default: config)
    #[arg(short, long, env = "ERP_GATEWAY_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate all configuration sections
    All,

    /// Validate a single configuration section
    Component {
        /// Section name (databases, retry, circuit_breakers, query_cache, startup, chaos)
        name: String,
    },

    /// List environments that have an overlay file
    Environments,

    /// Print the merged configuration with secrets masked
    Show,

    /// Compare merged configurations between environments
    Compare {
        /// Base environment for comparison
        #[arg(short, long, default_value = "development")]
        base: String,

        /// Target environment for comparison
        #[arg(short, long)]
        target: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::All) | None => validate_all_config(&cli),
        Some(Commands::Component { name }) => validate_component(&cli, name),
        Some(Commands::Environments) => list_environments(&cli),
        Some(Commands::Show) => show_config(&cli),
        Some(Commands::Compare { base, target }) => compare_configs(&cli, base, target),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {e:#}");
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn config_dir(cli: &Cli) -> PathBuf {
    cli.config_dir.clone().unwrap_or_else(|| PathBuf::from("config"))
}

fn load(cli: &Cli, environment: &str) -> anyhow::Result<GatewayConfig> {
    let manager = ConfigManager::load_from_directory_with_env(Some(config_dir(cli)), environment)
        .with_context(|| format!("loading configuration for environment '{environment}'"))?;
    Ok(manager.config().clone())
}

fn validate_all_config(cli: &Cli) -> anyhow::Result<()> {
    println!("🔧 Validating ERP Gateway Configuration");
    println!("Environment: {}", cli.environment);
    println!("Config Directory: {}", config_dir(cli).display());
    println!();

    let config = load(cli, &cli.environment)?;
    println!("✅ Configuration loaded, merged and validated");

    validate_databases_config(&config)?;
    validate_retry_config(&config)?;
    validate_circuit_breakers_config(&config)?;
    validate_query_cache_config(&config)?;
    validate_startup_config(&config)?;
    validate_chaos_config(&config)?;

    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn validate_component(cli: &Cli, component_name: &str) -> anyhow::Result<()> {
    println!("🔧 Validating Component: {component_name}");
    let config = load(cli, &cli.environment)?;

    match component_name.to_lowercase().as_str() {
        "databases" | "database" => validate_databases_config(&config)?,
        "retry" => validate_retry_config(&config)?,
        "circuit_breakers" | "circuit-breakers" => validate_circuit_breakers_config(&config)?,
        "query_cache" | "query-cache" | "cache" => validate_query_cache_config(&config)?,
        "startup" => validate_startup_config(&config)?,
        "chaos" => validate_chaos_config(&config)?,
        _ => bail!("Unknown component: {component_name}"),
    }

    println!("✅ Component '{component_name}' validation passed!");
    Ok(())
}

fn list_environments(cli: &Cli) -> anyhow::Result<()> {
    println!("📋 Available Environments:");
    let dir = config_dir(cli);
    if !dir.is_dir() {
        println!("❌ Configuration directory not found: {}", dir.display());
        return Ok(());
    }

    for env in environments_in(&dir)? {
        println!("  • {env}");
    }
    Ok(())
}

/// Environment names with an `erp-gateway-{env}.toml` overlay
fn environments_in(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut environments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(env) = name
            .strip_prefix("erp-gateway-")
            .and_then(|rest| rest.strip_suffix(".toml"))
        {
            environments.push(env.to_string());
        }
    }
    environments.sort();
    Ok(environments)
}

fn show_config(cli: &Cli) -> anyhow::Result<()> {
    let manager =
        ConfigManager::load_from_directory_with_env(Some(config_dir(cli)), &cli.environment)?;
    println!("{}", serde_json::to_string_pretty(&manager.debug_config())?);
    Ok(())
}

fn compare_configs(cli: &Cli, base: &str, target: &str) -> anyhow::Result<()> {
    println!("🔍 Comparing Configurations: {base} vs {target}");
    let dir = config_dir(cli);
    let base_json = ConfigManager::load_from_directory_with_env(Some(dir.clone()), base)?.debug_config();
    let target_json = ConfigManager::load_from_directory_with_env(Some(dir), target)?.debug_config();

    let mut differences = Vec::new();
    diff_values("", &base_json, &target_json, &mut differences);

    if differences.is_empty() {
        println!("✅ No differences");
    }
    for (path, left, right) in differences {
        println!("  {path}: {left} -> {right}");
    }
    Ok(())
}

fn diff_values(path: &str, left: &Value, right: &Value, out: &mut Vec<(String, Value, Value)>) {
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => {
            let mut keys: Vec<&String> = l.keys().chain(r.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                diff_values(
                    &child,
                    l.get(key).unwrap_or(&Value::Null),
                    r.get(key).unwrap_or(&Value::Null),
                    out,
                );
            }
        }
        _ if left != right => out.push((path.to_string(), left.clone(), right.clone())),
        _ => {}
    }
}

// Section validation functions

fn validate_databases_config(config: &GatewayConfig) -> anyhow::Result<()> {
    println!("🗄️  Validating Database Configuration...");
    println!("   ✅ Driver: {}", config.driver);

    for db in LogicalDb::ALL {
        let settings = config.database(db);
        settings.validate(db, config.driver)?;
        if config.driver == DriverKind::Tds && settings.password.is_empty() {
            warn!("   ⚠️  {db}: empty password, relying on server-side trust");
        }
        println!(
            "   ✅ {db}: {} (pool min: {}, max: {}, request timeout: {}ms)",
            settings.endpoint_label(config.driver),
            settings.pool.min_connections,
            settings.pool.max_connections,
            settings.request_timeout_ms
        );
    }
    Ok(())
}

fn validate_retry_config(config: &GatewayConfig) -> anyhow::Result<()> {
    println!("🔄 Validating Retry Configuration...");
    config.retry.validate()?;
    let retry = &config.retry;
    println!(
        "   ✅ {} attempts, {}ms initial, x{} up to {}ms",
        retry.max_attempts, retry.initial_delay_ms, retry.backoff_factor, retry.max_delay_ms
    );
    if retry.jitter_enabled {
        println!("   ✅ Jitter: ±{:.0}%", retry.jitter_factor * 100.0);
    }
    Ok(())
}

fn validate_circuit_breakers_config(config: &GatewayConfig) -> anyhow::Result<()> {
    println!("🛡️  Validating Circuit Breaker Configuration...");
    config.circuit_breakers.validate()?;
    let breakers = &config.circuit_breakers;
    if !breakers.enabled {
        warn!("   ⚠️  Circuit breakers are disabled");
    }
    let default = &breakers.default_config;
    println!(
        "   ✅ Default: {} failures in {}ms, cool-down {}ms",
        default.failure_threshold, default.window_ms, default.cool_down_ms
    );
    let mut components: Vec<_> = breakers.component_configs.iter().collect();
    components.sort_by(|a, b| a.0.cmp(b.0));
    for (name, component) in components {
        println!(
            "   ✅ {name}: {} failures in {}ms, cool-down {}ms",
            component.failure_threshold, component.window_ms, component.cool_down_ms
        );
    }
    Ok(())
}

fn validate_query_cache_config(config: &GatewayConfig) -> anyhow::Result<()> {
    println!("🗃️  Validating Query Cache Configuration...");
    let cache = &config.query_cache;
    cache.validate().map_err(anyhow::Error::msg)?;
    if !cache.enabled {
        println!("   ℹ️  Query cache disabled");
        return Ok(());
    }
    println!(
        "   ✅ L1: {} entries, TTL {}s",
        cache.l1.max_entries, cache.default_ttl_seconds
    );
    match cache.l2.backend {
        L2Backend::Redis => println!(
            "   ✅ L2: redis (prefix '{}', timeout {}ms)",
            cache.l2.key_prefix, cache.l2.operation_timeout_ms
        ),
        L2Backend::Memory => println!("   ✅ L2: in-process memory store"),
        L2Backend::None => println!("   ℹ️  L2 disabled"),
    }
    Ok(())
}

fn validate_startup_config(config: &GatewayConfig) -> anyhow::Result<()> {
    println!("🚦 Validating Startup Configuration...");
    config.startup.validate()?;
    println!(
        "   ✅ {} probe attempts with '{}'",
        config.startup.max_attempts, config.startup.probe_query
    );
    Ok(())
}

fn validate_chaos_config(config: &GatewayConfig) -> anyhow::Result<()> {
    println!("🧪 Validating Chaos Configuration...");
    if config.chaos.enabled {
        warn!("   ⚠️  Fault injection is enabled");
        println!("   ⚠️  Fault injection enabled (seed: {:?})", config.chaos.seed);
    } else {
        println!("   ✅ Fault injection disabled");
    }
    Ok(())
}
