use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogSettings;
use crate::error::{Error, Result};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. When a log directory is set,
/// output goes to a daily-rolled file through a non-blocking writer whose
/// guard must be held until exit so buffered lines are flushed.
pub fn init_logging(settings: &LogSettings) -> Result<Option<WorkerGuard>> {
  let level = parse_log_level(&settings.level)?;
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    EnvFilter::new(format!("{},hyper=warn,reqwest=warn", level.as_str().to_lowercase()))
  });

  let (writer, guard) = match LogTarget::from_settings(settings) {
    LogTarget::File(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "dlhd-proxy.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (fmt::writer::BoxMakeWriter::new(writer), Some(guard))
    }
    LogTarget::Stderr => (fmt::writer::BoxMakeWriter::new(std::io::stderr), None),
  };
  let ansi = settings.dir.is_none();

  let registry = tracing_subscriber::registry().with(env_filter);
  let installed = match settings.format.to_lowercase().as_str() {
    "json" => registry.with(fmt::layer().json().with_target(true).with_writer(writer)).try_init(),
    "pretty" => registry.with(fmt::layer().pretty().with_ansi(ansi).with_writer(writer)).try_init(),
    "compact" => registry.with(fmt::layer().compact().with_ansi(ansi).with_writer(writer)).try_init(),
    other => return Err(Error::Configuration(format!("unknown log format '{other}'"))),
  };
  installed.map_err(|e| Error::Configuration(format!("failed to install logger: {e}")))?;
  Ok(guard)
}

/// Where log lines go.
#[derive(Debug, PartialEq, Eq)]
enum LogTarget<'a> {
  Stderr,
  File(&'a Path),
}

impl<'a> LogTarget<'a> {
  fn from_settings(settings: &'a LogSettings) -> Self {
    match settings.dir.as_deref() {
      Some(dir) => Self::File(dir),
      None => Self::Stderr,
    }
  }
}

fn parse_log_level(level: &str) -> Result<Level> {
  match level.to_lowercase().as_str() {
    "trace" => Ok(Level::TRACE),
    "debug" => Ok(Level::DEBUG),
    "info" => Ok(Level::INFO),
    "warn" | "warning" => Ok(Level::WARN),
    "error" => Ok(Level::ERROR),
    _ => Err(Error::Configuration(format!("invalid log level '{level}'"))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn log_levels() {
    assert_eq!(parse_log_level("WARNING").unwrap(), Level::WARN);
    assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
    assert!(matches!(parse_log_level("loud"), Err(Error::Configuration(_))));
  }

  #[test]
  fn logs_to_stderr_unless_a_directory_is_set() {
    let settings = LogSettings::default();
    assert_eq!(LogTarget::from_settings(&settings), LogTarget::Stderr);

    let settings = LogSettings { dir: Some("/var/log/dlhd".into()), ..LogSettings::default() };
    assert_eq!(LogTarget::from_settings(&settings), LogTarget::File(Path::new("/var/log/dlhd")));
  }
}
