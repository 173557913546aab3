use chrono::NaiveTime;
use chrono_tz::Tz;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const SETTINGS_FILE: &str = "settings.toml";

/// Whether channels excluded from the playlist still get guide entries.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GuideExcluded {
  #[default]
  Omit,
  Include,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LogSettings {
  pub level: String,
  /// `pretty`, `json` or `compact`.
  pub format: String,
  /// Daily-rolled log files are written here when set.
  pub dir: Option<PathBuf>,
}

impl Default for LogSettings {
  fn default() -> Self {
    Self { level: "info".to_string(), format: "compact".to_string(), dir: None }
  }
}

/// Raw settings as read from `settings.toml` and overridden from the CLI/environment.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Settings {
  pub port: u16,
  pub api_url: Option<String>,
  pub socks5: Option<String>,
  pub proxy_content: bool,
  pub timezone: String,
  pub guide_update: String,
  pub data_dir: Option<PathBuf>,
  pub upstream_url: String,
  pub channel_meta: Option<PathBuf>,
  pub guide_excluded: GuideExcluded,
  pub log: LogSettings,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      port: 3000,
      api_url: None,
      socks5: None,
      proxy_content: true,
      timezone: "UTC".to_string(),
      guide_update: "03:00".to_string(),
      data_dir: None,
      upstream_url: "https://daddylivestream.com".to_string(),
      channel_meta: None,
      guide_excluded: GuideExcluded::Omit,
      log: LogSettings::default(),
    }
  }
}

/// Validated, immutable configuration shared by every component.
#[derive(Debug, Clone)]
pub struct AppConfig {
  pub port: u16,
  /// Externally reachable base URL, without trailing slash.
  pub api_url: String,
  pub socks5: Option<String>,
  pub proxy_content: bool,
  pub timezone: Tz,
  pub guide_update: NaiveTime,
  pub data_dir: PathBuf,
  pub upstream_url: String,
  pub channel_meta: Option<PathBuf>,
  pub guide_excluded: GuideExcluded,
}

impl AppConfig {
  pub fn selection_path(&self) -> PathBuf {
    self.data_dir.join("channels.json")
  }

  pub fn guide_path(&self) -> PathBuf {
    self.data_dir.join("guide.xml")
  }

  pub fn logo_cache_dir(&self) -> PathBuf {
    self.data_dir.join("logo-cache")
  }
}

impl Settings {
  /// Load from `path`, else the platform config dir, else defaults.
  ///
  /// An explicitly named file that cannot be read or parsed is an error; a
  /// missing file in the default location is not.
  pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
    use anyhow::Context;

    if let Some(path) = path {
      let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read settings file {}", path.display()))?;
      return toml::from_str(&content).with_context(|| format!("Failed to parse settings file {}", path.display()));
    }
    if let Some(proj_dirs) = ProjectDirs::from("", "", "dlhd-proxy") {
      let config_file = proj_dirs.config_dir().join(SETTINGS_FILE);
      if let Ok(content) = std::fs::read_to_string(&config_file) {
        return toml::from_str(&content)
          .with_context(|| format!("Failed to parse settings file {}", config_file.display()));
      }
    }
    Ok(Self::default())
  }

  pub fn resolve(&self) -> Result<AppConfig> {
    let timezone: Tz = self
      .timezone
      .parse()
      .map_err(|_| Error::Configuration(format!("unknown timezone '{}'", self.timezone)))?;
    let guide_update = parse_daily_time(&self.guide_update)?;

    let api_url = match &self.api_url {
      Some(url) if !url.trim().is_empty() => url.trim().trim_end_matches('/').to_string(),
      _ => format!("http://localhost:{}", self.port),
    };
    url::Url::parse(&api_url).map_err(|e| Error::Configuration(format!("invalid api_url '{api_url}': {e}")))?;

    let socks5 = self.socks5.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(|s| {
      // Accept both `host:port` and a full `socks5://host:port`.
      s.strip_prefix("socks5h://").or_else(|| s.strip_prefix("socks5://")).unwrap_or(s).to_string()
    });

    let data_dir = match &self.data_dir {
      Some(dir) => dir.clone(),
      None => ProjectDirs::from("", "", "dlhd-proxy")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("data")),
    };

    Ok(AppConfig {
      port: self.port,
      api_url,
      socks5,
      proxy_content: self.proxy_content,
      timezone,
      guide_update,
      data_dir,
      upstream_url: self.upstream_url.trim_end_matches('/').to_string(),
      channel_meta: self.channel_meta.clone(),
      guide_excluded: self.guide_excluded,
    })
  }
}

/// Parse `HH:MM` (24h) into a clock time.
pub fn parse_daily_time(s: &str) -> Result<NaiveTime> {
  NaiveTime::parse_from_str(s.trim(), "%H:%M")
    .map_err(|_| Error::Configuration(format!("daily refresh time '{s}' is not HH:MM")))
}
