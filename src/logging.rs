//! # Structured Logging Module
//!
//! Environment-aware structured logging to the console and a JSON log file,
//! plus a few structured operation loggers used at the gateway's seams.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; a subscriber installed elsewhere is kept.
/// `RUST_LOG` takes precedence over the environment's default level.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

        let console = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(filter());

        let log_dir = PathBuf::from("log");
        if let Err(e) = fs::create_dir_all(&log_dir) {
            let _ = tracing_subscriber::registry().with(console).try_init();
            tracing::warn!(error = %e, "Could not create log directory, logging to console only");
            return;
        }

        let pid = process::id();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_filename = format!("{environment}.{pid}.{timestamp}.log");
        let log_path = log_dir.join(&log_filename);

        let file_appender = tracing_appender::rolling::never(&log_dir, &log_filename);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = tracing_subscriber::registry().with(console).with(
            fmt::layer()
                .with_writer(file_writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(filter()),
        );

        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
            return;
        }

        tracing::info!(
            pid,
            environment = %environment,
            log_file = %log_path.display(),
            "Structured logging initialized with file output"
        );

        // The writer flushes on guard drop; keep it for the life of the process
        std::mem::forget(guard);
    });
}

/// Current environment from process variables
fn get_environment() -> String {
    std::env::var("ERP_GATEWAY_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Default log level for an environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        "test" | "development" => "debug".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log one ERP query outcome
pub fn log_query_operation(
    db: &str,
    operation: &str,
    status: &str,
    duration_ms: Option<u64>,
    retries: u32,
    details: Option<&str>,
) {
    tracing::info!(
        db = %db,
        operation = %operation,
        status = %status,
        duration_ms = duration_ms,
        retries,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "QUERY_OPERATION"
    );
}

/// Log a pool lifecycle or checkout event
pub fn log_pool_operation(
    pool: &str,
    operation: &str,
    status: &str,
    in_use: Option<u32>,
    idle: Option<u32>,
    details: Option<&str>,
) {
    tracing::info!(
        pool = %pool,
        operation = %operation,
        status = %status,
        in_use = in_use,
        idle = idle,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "POOL_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}
