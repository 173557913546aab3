mod catalog;
mod config;
mod constants;
mod error;
mod guide;
mod hls;
mod logging;
mod logo;
mod playlist;
mod proxy;
mod scheduler;
mod selection;
mod server;
mod token;
mod upstream;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use catalog::CatalogStore;
use config::{AppConfig, GuideExcluded, Settings};
use constants::constants;
use guide::{GuidePublisher, GuideRenderer};
use logo::LogoCache;
use proxy::StreamProxy;
use scheduler::{DailySchedule, Scheduler};
use selection::SelectionStore;
use server::AppState;
use upstream::{HttpUpstream, Upstream};

// --- CLI ---

#[derive(Parser, Debug)]
#[command(author, version = env!("CARGO_PKG_VERSION"), about, long_about = None)]
struct Args {
  /// Settings file (default: platform config dir, `settings.toml`)
  #[arg(short, long, env = "DLHD_CONFIG")]
  config: Option<PathBuf>,

  #[arg(long, env = "PORT")]
  port: Option<u16>,

  /// Externally reachable base URL used in playlist and guide links
  #[arg(long, env = "API_URL")]
  api_url: Option<String>,

  /// SOCKS5 relay for all upstream traffic, `host:port`
  #[arg(long, env = "SOCKS5")]
  socks5: Option<String>,

  /// Route media segments through this server ('true') or point clients at upstream ('false')
  #[arg(long, env = "PROXY_CONTENT")]
  proxy_content: Option<bool>,

  /// IANA timezone for guide times and the daily refresh
  #[arg(long, env = "TZ")]
  timezone: Option<String>,

  /// Daily guide refresh time, HH:MM
  #[arg(long, env = "GUIDE_UPDATE")]
  guide_update: Option<String>,

  #[arg(long, env = "DATA_DIR")]
  data_dir: Option<PathBuf>,

  #[arg(long, env = "UPSTREAM_URL")]
  upstream_url: Option<String>,

  /// JSON file mapping channel names to logo and tags
  #[arg(long, env = "CHANNEL_META")]
  channel_meta: Option<PathBuf>,

  /// Whether excluded channels still appear in the guide
  #[arg(long, env = "GUIDE_EXCLUDED", value_enum)]
  guide_excluded: Option<GuideExcluded>,

  #[arg(long, env = "LOG_LEVEL")]
  log_level: Option<String>,

  /// 'compact', 'pretty' or 'json'
  #[arg(long, env = "LOG_FORMAT")]
  log_format: Option<String>,

  #[arg(long, env = "LOG_DIR")]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print shell completions to stdout
  Completions { shell: clap_complete::Shell },
}

impl Args {
  /// Command-line and environment values win over the settings file.
  fn apply(self, settings: &mut Settings) {
    if let Some(port) = self.port {
      settings.port = port;
    }
    if self.api_url.is_some() {
      settings.api_url = self.api_url;
    }
    if self.socks5.is_some() {
      settings.socks5 = self.socks5;
    }
    if let Some(proxy_content) = self.proxy_content {
      settings.proxy_content = proxy_content;
    }
    if let Some(tz) = self.timezone {
      settings.timezone = tz;
    }
    if let Some(at) = self.guide_update {
      settings.guide_update = at;
    }
    if self.data_dir.is_some() {
      settings.data_dir = self.data_dir;
    }
    if let Some(url) = self.upstream_url {
      settings.upstream_url = url;
    }
    if self.channel_meta.is_some() {
      settings.channel_meta = self.channel_meta;
    }
    if let Some(policy) = self.guide_excluded {
      settings.guide_excluded = policy;
    }
    if let Some(level) = self.log_level {
      settings.log.level = level;
    }
    if let Some(format) = self.log_format {
      settings.log.format = format;
    }
    if self.log_dir.is_some() {
      settings.log.dir = self.log_dir;
    }
  }
}

// --- Main ---

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();

  if let Some(Command::Completions { shell }) = &args.command {
    clap_complete::generate(*shell, &mut Args::command(), env!("CARGO_PKG_NAME"), &mut std::io::stdout());
    return Ok(());
  }

  let mut settings = Settings::load(args.config.as_deref())?;
  args.apply(&mut settings);

  let _log_guard = logging::init_logging(&settings.log).context("Failed to initialise logging")?;
  let config = settings.resolve().context("Invalid configuration")?;
  run(config).await
}

async fn run(config: AppConfig) -> Result<()> {
  info!(
    port = config.port,
    api_url = %config.api_url,
    proxy_content = config.proxy_content,
    socks5 = config.socks5.is_some(),
    timezone = %config.timezone,
    data_dir = %config.data_dir.display(),
    "dlhd-proxy: starting"
  );

  let meta = HttpUpstream::load_meta(config.channel_meta.as_deref());
  let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(&config, meta).context("Failed to build upstream client")?);
  let catalog = Arc::new(CatalogStore::new());
  let selection = Arc::new(SelectionStore::load(config.selection_path()).await);
  let guide = Arc::new(GuidePublisher::load(config.guide_path()).await);

  // `background` stops the scheduler and the listener; `streams` ends live
  // media sessions once the grace period is over.
  let background = CancellationToken::new();
  let streams = CancellationToken::new();

  let proxy = Arc::new(StreamProxy::new(
    upstream.clone(),
    catalog.clone(),
    config.api_url.clone(),
    config.proxy_content,
    streams.clone(),
  ));
  let logos = Arc::new(LogoCache::new(config.logo_cache_dir(), upstream.clone(), catalog.clone()));

  let scheduler = Arc::new(Scheduler::new(
    upstream,
    catalog.clone(),
    selection.clone(),
    guide.clone(),
    GuideRenderer::from_config(&config),
    DailySchedule::new(config.guide_update, config.timezone),
    constants().catalog_refresh(),
  ));
  let scheduler_task = tokio::spawn(scheduler.run(background.clone()));

  let state = AppState { api_url: Arc::from(config.api_url.as_str()), catalog, selection, guide, proxy, logos };

  let listener = TcpListener::bind(("0.0.0.0", config.port))
    .await
    .with_context(|| format!("Failed to bind port {}", config.port))?;
  info!(addr = %listener.local_addr()?, "server: listening");

  let grace = constants().shutdown_grace();
  let on_shutdown = background.clone();
  tokio::spawn(async move {
    on_shutdown.cancelled().await;
    tokio::time::sleep(grace).await;
    warn!(grace_secs = grace.as_secs(), "server: grace period over, closing remaining streams");
    streams.cancel();
  });

  let trigger = background.clone();
  axum::serve(listener, server::router(state))
    .with_graceful_shutdown(async move {
      shutdown_signal().await;
      info!("server: shutdown requested");
      trigger.cancel();
    })
    .await
    .context("Server error")?;

  background.cancel();
  if let Err(e) = scheduler_task.await {
    warn!(err = %e, "scheduler: task failed");
  }
  info!("dlhd-proxy: stopped");
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      warn!(err = %e, "server: cannot listen for ctrl-c");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut signal) => {
        signal.recv().await;
      }
      Err(e) => {
        warn!(err = %e, "server: cannot listen for SIGTERM");
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    () = ctrl_c => {}
    () = terminate => {}
  }
}
