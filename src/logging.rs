//! File logging setup.
//!
//! Logs go to a daily-rolling file so stdout stays free for response bodies.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Environment variable that overrides the log filter
const LOG_ENV: &str = "SHELLCACHE_LOG";

/// Install the global subscriber. Keep the guard alive until exit so
/// buffered lines are flushed.
pub fn init(log_dir: &Path, verbose: u8) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let filter =
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

  let appender = tracing_appender::rolling::daily(log_dir, "shellcache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn default_directive(verbose: u8) -> &'static str {
  match verbose {
    0 => "shellcache=info",
    1 => "shellcache=debug",
    _ => "shellcache=trace",
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_verbosity_levels() {
    assert_eq!(default_directive(0), "shellcache=info");
    assert_eq!(default_directive(1), "shellcache=debug");
    assert_eq!(default_directive(5), "shellcache=trace");
  }
}
