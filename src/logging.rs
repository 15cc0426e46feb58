//! # Structured Logging Module
//!
//! Environment-aware structured logging that outputs to both console and
//! files, for tracing task flows across dispatcher, workers, and the
//! correlator.

use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ConfigManager;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Console output is human-readable with ANSI colors; a JSON copy goes to
/// `{log_dir}/{environment}.{pid}.{timestamp}.log` for ingestion. The log
/// directory comes from `EASEL_LOG_DIR`, defaulting to `log/`. Safe to call
/// more than once; only the first call wins.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let log_level =
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_log_level(&environment));

        let log_dir =
            PathBuf::from(std::env::var("EASEL_LOG_DIR").unwrap_or_else(|_| "log".to_string()));
        let file_layer_enabled = log_dir.is_dir() || fs::create_dir_all(&log_dir).is_ok();

        let pid = process::id();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_filename = format!("{environment}.{pid}.{timestamp}.log");

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(EnvFilter::new(log_level.clone()));

        if file_layer_enabled {
            let file_appender = tracing_appender::rolling::never(&log_dir, &log_filename);
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(EnvFilter::new(log_level)),
            );

            // try_init so an embedding application's subscriber wins quietly
            if subscriber.try_init().is_err() {
                tracing::debug!(
                    "Global tracing subscriber already initialized - continuing with existing subscriber"
                );
            }

            tracing::info!(
                pid = pid,
                environment = %environment,
                log_file = %log_dir.join(&log_filename).display(),
                "🔧 STRUCTURED LOGGING: Initialized with file output"
            );

            // The non-blocking writer flushes only while its guard lives;
            // the guard must last for the whole process
            std::mem::forget(guard);
        } else {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if subscriber.try_init().is_err() {
                tracing::debug!(
                    "Global tracing subscriber already initialized - continuing with existing subscriber"
                );
            }

            tracing::warn!(
                log_dir = %log_dir.display(),
                "🔧 STRUCTURED LOGGING: Log directory unavailable, console output only"
            );
        }
    });
}

/// Default log level per environment, overridable via `RUST_LOG`
fn default_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for task submission operations
pub fn log_task_operation(
    operation: &str,
    task_id: uuid::Uuid,
    task_type: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = %task_id,
        task_type = %task_type,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 TASK_OPERATION"
    );
}

/// Log structured data for delivery handling inside a worker
pub fn log_delivery_operation(
    operation: &str,
    queue: &str,
    task_id: Option<uuid::Uuid>,
    attempt: Option<u32>,
    outcome: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        queue = %queue,
        task_id = task_id.map(|id| id.to_string()),
        attempt = attempt,
        outcome = %outcome,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📦 DELIVERY_OPERATION"
    );
}

/// Log structured data for result correlation
pub fn log_correlation_operation(
    operation: &str,
    task_id: uuid::Uuid,
    subscriptions: usize,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = %task_id,
        subscriptions = subscriptions,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔗 CORRELATION_OPERATION"
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
        "❌ ERROR"
    );
}
