use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

/// Send logs to `fetchcache.log` in the platform data directory.
///
/// `RUST_LOG` wins when no `-v` flag is given. Keep the returned guard alive
/// until exit so buffered lines are flushed.
pub fn init(verbose: u8) -> Result<WorkerGuard> {
  let dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("fetchcache");
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let filter = match verbose {
    0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    1 => EnvFilter::new("debug"),
    _ => EnvFilter::new("trace"),
  };

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, "fetchcache.log"));

  fmt()
    .with_env_filter(filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(writer)
    .init();

  Ok(guard)
}
