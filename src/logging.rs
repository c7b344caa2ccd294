//! Log output for the daemon and one-shot commands.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;
use crate::db;

/// Install the global subscriber.
///
/// Logs go to a daily-rolling file under the configured directory (default:
/// the data dir). `RUST_LOG` overrides the configured level. With `verbose`
/// the same events are mirrored to stderr. Keep the returned guard alive
/// until exit or buffered lines are lost.
pub fn init(config: &LogConfig, verbose: bool) -> Result<WorkerGuard> {
  let directory = match &config.directory {
    Some(dir) => dir.clone(),
    None => db::data_dir()?.join("logs"),
  };
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let appender = tracing_appender::rolling::daily(&directory, "tripsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

  let stderr = verbose.then(|| fmt::layer().with_target(false).with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_ansi(false).with_writer(writer))
    .with(stderr)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
