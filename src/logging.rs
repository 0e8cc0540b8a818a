//! Tracing subscriber setup.
//!
//! `RUST_LOG`, when set, overrides `application.log_level` from configuration.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::ProtocolConfig;

/// Install the global fmt subscriber for the configured log level.
///
/// Returns an error if a global subscriber is already installed.
pub fn init_from_config(config: &ProtocolConfig) -> Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(rust_log.as_deref(), &config.application.log_level))
        .with_target(false)
        .try_init()
        .map_err(anyhow::Error::msg)
}

fn env_filter(rust_log: Option<&str>, level: &str) -> EnvFilter {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_level_used_without_rust_log() {
        assert_eq!(env_filter(None, "debug").to_string(), "debug");
        assert_eq!(env_filter(Some("  "), "warn").to_string(), "warn");
    }

    #[test]
    fn test_rust_log_overrides_config() {
        let filter = env_filter(Some("polartron=trace"), "info");
        assert_eq!(filter.to_string(), "polartron=trace");
    }
}
