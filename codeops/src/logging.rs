//! Diagnostics via `tracing`, written to stderr.
//!
//! Run results go to stdout as JSON; everything here is for operators.
//! The filter comes from `RUST_LOG`, else `LOG_LEVEL` (a bare level such as
//! `debug`), else `info`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_DIRECTIVE: &str = "info";

/// Pick the filter directive from the two environment values.
pub fn directive(rust_log: Option<&str>, log_level: Option<&str>) -> String {
    [rust_log, log_level]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_string())
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init() {
    let rust_log = std::env::var("RUST_LOG").ok();
    let log_level = std::env::var("LOG_LEVEL").ok();
    let wanted = directive(rust_log.as_deref(), log_level.as_deref());
    let filter = EnvFilter::try_new(&wanted).unwrap_or_else(|err| {
        eprintln!("invalid log filter '{wanted}': {err}; using {DEFAULT_DIRECTIVE}");
        EnvFilter::new(DEFAULT_DIRECTIVE)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_wins() {
        assert_eq!(directive(Some("codeops=debug"), Some("warn")), "codeops=debug");
    }

    #[test]
    fn log_level_is_the_fallback() {
        assert_eq!(directive(None, Some("WARNING")), "warning");
        assert_eq!(directive(Some("  "), Some("Debug")), "debug");
    }

    #[test]
    fn defaults_to_info() {
        assert_eq!(directive(None, None), "info");
    }
}
