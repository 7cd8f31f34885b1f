//! # Structured Logging Module
//!
//! Environment-aware `tracing` setup. Console output by default, JSON lines
//! when `NEGOTIATION_LOG_FORMAT=json`. The level comes from `RUST_LOG` when
//! set, otherwise from the deployment environment.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

pub const LOG_FORMAT_ENV: &str = "NEGOTIATION_LOG_FORMAT";

/// Initialize structured logging once per process
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = wants_json(std::env::var(LOG_FORMAT_ENV).ok().as_deref());

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // Embedding applications may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized, keeping it");
            return;
        }

        tracing::info!(
            environment = %environment,
            json,
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("NEGOTIATION_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

fn wants_json(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.eq_ignore_ascii_case("json"))
}

/// Uniform record for one negotiation operation
pub fn log_negotiation_operation(
    operation: &str,
    negotiation_id: Option<&str>,
    negotiation_type: Option<&str>,
    state: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        negotiation_id = negotiation_id,
        negotiation_type = negotiation_type,
        state = state,
        status = %status,
        details = details,
        "NEGOTIATION_OPERATION"
    );
}
