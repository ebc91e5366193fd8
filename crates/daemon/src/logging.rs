//! Tracing subscriber setup.
//!
//! Logs go to stderr, or to an append-only file when one is configured. The
//! file is opened here, before any root change, so it stays writable from
//! inside the chroot.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the background log writer alive. Dropping it flushes the file.
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

/// Build the filter: `RUST_LOG` wins, then `--verbose`, then the configured
/// level.
pub fn build_filter(level: &str, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if verbose { "debug" } else { level };
    EnvFilter::new(level.to_lowercase())
}

/// Install the global subscriber.
pub fn init_logging(level: &str, verbose: bool, log_file: Option<&Path>) -> Result<LogGuard> {
    let filter = build_filter(level, verbose);

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
        return Ok(LogGuard { _guard: None });
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
        .init();

    Ok(LogGuard {
        _guard: Some(guard),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_filter_from_level() {
        std::env::remove_var("RUST_LOG");
        assert_eq!(build_filter("WARN", false).to_string(), "warn");
        assert_eq!(build_filter("warn", true).to_string(), "debug");
    }

    #[test]
    #[serial]
    fn test_rust_log_wins() {
        std::env::set_var("RUST_LOG", "wfm=trace");
        let filter = build_filter("info", true);
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter.to_string(), "wfm=trace");
    }
}
