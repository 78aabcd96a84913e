use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::models::LoggingConfig;

/// Initialize logging as configured: `format` picks text or JSON output,
/// `level` seeds the filter unless `RUST_LOG` overrides it.
pub fn init_from_config(logging: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_level(&logging.level)?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    if logging.format.eq_ignore_ascii_case("json") {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(false)
                    .with_span_list(true),
            )
            .try_init()
    } else {
        Registry::default().with(env_filter).with(fmt_layer).try_init()
    }
    .wrap_err("Failed to install the tracing subscriber")?;

    tracing::info!(
        level = %logging.level,
        format = %logging.format,
        "logging initialized"
    );
    Ok(())
}

fn parse_level(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))
}

/// Flush point before process exit.
pub fn shutdown_tracing() {
    tracing::info!("tracing shutdown complete");
}
