//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured level, so a single driver
//! can be turned up with e.g. `RUST_LOG=rust_instr::instrument::orx_402a=trace`.

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Installs the global subscriber at `level`. Calling it again is a no-op.
pub fn init_logging(level: &str) -> Result<()> {
    init_logging_with(level, LogFormat::Pretty)
}

/// Like [`init_logging`], choosing the output format.
pub fn init_logging_with(level: &str, format: LogFormat) -> Result<()> {
    let filter = build_filter(level)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
    Ok(())
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = parse_level(level)?;
    let directive = format!("rust_instr={}", level)
        .parse()
        .context("Invalid log directive")?;
    Ok(EnvFilter::new("warn").add_directive(directive))
}

/// Parses a configured level name into a `tracing` level.
pub fn parse_level(level: &str) -> Result<tracing::Level> {
    level
        .parse()
        .map_err(|_| anyhow!("Invalid log level '{}'", level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert_eq!(parse_level("debug").unwrap(), tracing::Level::DEBUG);
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_logging("info").unwrap();
        init_logging_with("debug", LogFormat::Json).unwrap();
    }
}
