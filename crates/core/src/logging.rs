//! Structured logging bootstrap for AeroTask.
//!
//! `RUST_LOG` always wins; otherwise the configured default level is used.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, ServiceConfig};
use crate::error::{CoreError, Result};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize human-readable logging.
///
/// # Example
/// ```no_run
/// use aerotask_core::logging;
///
/// logging::init("info").unwrap();
/// tracing::info!("Application started");
/// ```
pub fn init(default_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init()
        .map_err(|e| CoreError::Logging(e.to_string()))
}

/// Initialize JSON logging for log aggregation.
///
/// # Example
/// ```no_run
/// use aerotask_core::logging;
///
/// logging::init_json("info").unwrap();
/// tracing::info!(vehicle_id = "uav-1", "Vehicle connected");
/// ```
pub fn init_json(default_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .try_init()
        .map_err(|e| CoreError::Logging(e.to_string()))
}

/// Initialize logging as described by the service section
pub fn init_from_config(service: &ServiceConfig) -> Result<()> {
    match service.log_format {
        LogFormat::Pretty => init(&service.log_level),
        LogFormat::Json => init_json(&service.log_level),
    }
}
