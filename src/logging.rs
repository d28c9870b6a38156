use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, EnvFilter};

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Daemon logging: append to `log_file`. Failing to open it is fatal.
pub fn init_file_logging(level: &str, log_file: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("failed to open log file {}", log_file.display()))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter(level))
        .with_target(true)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Client-side logging to stderr.
pub fn init_stderr_logging(level: &str) {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter(level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::{filter, init_file_logging};
    use tempfile::TempDir;

    #[test]
    fn level_string_becomes_filter() {
        assert_eq!(filter("debug").to_string(), "debug");
    }

    #[test]
    fn unopenable_log_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("no-such-dir").join("daemon.log");
        assert!(init_file_logging("info", &missing).is_err());
    }
}
