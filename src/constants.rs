//! Application constants loaded from `constants.ron` at compile time.
//!
//! The RON file is embedded via `include_str!` so it's always available,
//! no runtime file I/O. Parsed once on first access via `LazyLock`.

use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;

/// All tuneable application constants.
#[derive(Debug, Deserialize)]
pub struct Constants {
  pub user_agent: String,

  // Upstream client
  pub request_timeout_secs: u64,
  pub connect_timeout_secs: u64,
  pub media_timeout_secs: u64,
  pub upstream_concurrency: usize,
  pub pool_idle_per_host: usize,

  // Retry
  pub retry_attempts: u32,
  pub retry_base_delay_ms: u64,
  pub retry_max_delay_ms: u64,

  // Stream resolution
  pub stream_server_template: String,
  pub top1_server_template: String,
  pub target_ttl_secs: u64,

  // Catalog / guide
  pub catalog_refresh_secs: u64,
  pub event_duration_mins: i64,

  // Shutdown
  pub shutdown_grace_secs: u64,
}

impl Constants {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }

  pub fn media_timeout(&self) -> Duration {
    Duration::from_secs(self.media_timeout_secs)
  }

  pub fn catalog_refresh(&self) -> Duration {
    Duration::from_secs(self.catalog_refresh_secs)
  }

  pub fn target_ttl(&self) -> Duration {
    Duration::from_secs(self.target_ttl_secs)
  }

  pub fn shutdown_grace(&self) -> Duration {
    Duration::from_secs(self.shutdown_grace_secs)
  }
}

static CONSTANTS: LazyLock<Constants> = LazyLock::new(|| {
  // Safety: the RON file is embedded at compile time; if it's malformed every test fails immediately.
  ron::from_str(include_str!("../constants.ron")).expect("constants.ron must be valid RON (embedded at compile time)")
});

/// Returns a reference to the parsed application constants.
pub fn constants() -> &'static Constants {
  &CONSTANTS
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn embedded_constants_parse() {
    let c = constants();
    assert!(c.retry_attempts >= 1);
    assert!(c.upstream_concurrency > 0);
    assert!(c.stream_server_template.contains("{channel_key}"));
    assert!(c.top1_server_template.contains("{channel_key}"));
  }
}
