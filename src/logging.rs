use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogConfig;

/// Environment variable holding filter directives, e.g. `taskdeck=debug`.
pub const LOG_ENV: &str = "TASKDECK_LOG";

const LOG_FILE: &str = "taskdeck.log";

/// Install the global subscriber, writing to a daily-rotated file.
///
/// Stdout and stderr stay clean for command output. The returned guard
/// flushes buffered lines on drop, so keep it alive for the whole run.
pub fn init(config: &LogConfig) -> Result<WorkerGuard> {
  let dir = log_dir(config)?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let file_appender = rolling::daily(&dir, LOG_FILE);
  let (writer, guard) = tracing_appender::non_blocking(file_appender);

  let file_layer = tracing_subscriber::fmt::layer()
    .with_writer(writer)
    .with_ansi(false)
    .with_target(true)
    .with_filter(env_filter(config));

  tracing_subscriber::registry()
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn env_filter(config: &LogConfig) -> EnvFilter {
  let default = config.level.as_deref().unwrap_or("info");
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Configured directory, or $XDG_DATA_HOME/taskdeck/logs
pub fn log_dir(config: &LogConfig) -> Result<PathBuf> {
  if let Some(dir) = &config.dir {
    return Ok(dir.clone());
  }
  dirs::data_dir()
    .map(|d| d.join("taskdeck").join("logs"))
    .ok_or_else(|| eyre!("Could not determine data directory"))
}
