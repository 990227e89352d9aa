//! Structured JSON logging setup using tracing.
//!
//! Embedders that already install a subscriber can skip this module; the
//! crate only emits `tracing` events.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{IliosError, IliosResult};

/// Initialize the tracing subscriber with JSON output.
///
/// `RUST_LOG` takes precedence over `filter` (e.g. "info,xavyo_ilios_sync=debug").
///
/// # Errors
///
/// Fails if the filter is invalid or a global subscriber is already set.
pub fn init_logging(filter: &str) -> IliosResult<()> {
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .map_err(|e| IliosError::Config(format!("Invalid log filter '{filter}': {e}")))?;

    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter_layer)
        .try_init()
        .map_err(|e| IliosError::Config(format!("Failed to install subscriber: {e}")))?;

    tracing::info!(filter = %filter, "Logging initialized");
    Ok(())
}

/// Initialize logging for tests (with simpler output). Safe to call repeatedly.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}
