//! Stream proxy: resolve, fetch, rewrite, stream.
//!
//! Clients only ever see `{api_url}/stream/{id}/...` URLs. Nested manifests,
//! segments and keys are addressed by opaque tokens minted by [`TokenCodec`],
//! so the upstream host never appears in anything served to a client.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::catalog::{CatalogStore, Channel};
use crate::constants::constants;
use crate::error::{Error, Result};
use crate::hls::{self, Rewriter, UriKind};
use crate::token::TokenCodec;
use crate::upstream::retry::RetryPolicy;
use crate::upstream::{ByteStream, MediaStream, StreamTarget, Upstream};

pub const MPEGURL: &str = "application/vnd.apple.mpegurl";

/// Upper bound for a segment response that turns out to be a manifest.
const MAX_INLINE_MANIFEST: usize = 4 * 1024 * 1024;

/// What the proxy hands back to the HTTP layer.
pub enum ProxyResponse {
  /// A rewritten manifest, always served as `application/vnd.apple.mpegurl`.
  Manifest(String),
  /// A small fully-buffered payload such as a key.
  Bytes { content_type: &'static str, body: Bytes },
  /// Media bytes copied through as they arrive.
  Stream { content_type: Option<String>, content_length: Option<u64>, body: ByteStream },
}

impl std::fmt::Debug for ProxyResponse {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Manifest(m) => f.debug_tuple("Manifest").field(&m.len()).finish(),
      Self::Bytes { content_type, body } => {
        f.debug_struct("Bytes").field("content_type", content_type).field("len", &body.len()).finish()
      }
      Self::Stream { content_type, .. } => f.debug_struct("Stream").field("content_type", content_type).finish(),
    }
  }
}

#[derive(Debug, Default)]
pub struct ProxyStats {
  active: AtomicU64,
  sessions: AtomicU64,
  bytes: AtomicU64,
  manifests: AtomicU64,
  failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
  pub active_sessions: u64,
  pub total_sessions: u64,
  pub bytes_streamed: u64,
  pub manifests_served: u64,
  pub upstream_failures: u64,
}

impl ProxyStats {
  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      active_sessions: self.active.load(Ordering::Relaxed),
      total_sessions: self.sessions.load(Ordering::Relaxed),
      bytes_streamed: self.bytes.load(Ordering::Relaxed),
      manifests_served: self.manifests.load(Ordering::Relaxed),
      upstream_failures: self.failures.load(Ordering::Relaxed),
    }
  }
}

/// One in-flight media transfer. Closing is logged on drop, which covers
/// normal completion, upstream errors and client disconnects alike.
struct ProxySession {
  channel_id: String,
  host: String,
  started: Instant,
  bytes: u64,
  outcome: &'static str,
  stats: Arc<ProxyStats>,
}

impl ProxySession {
  fn open(channel_id: &str, url: &Url, stats: Arc<ProxyStats>) -> Self {
    stats.active.fetch_add(1, Ordering::Relaxed);
    stats.sessions.fetch_add(1, Ordering::Relaxed);
    let host = url.host_str().unwrap_or_default().to_string();
    debug!(channel = channel_id, host = %host, "proxy: session opened");
    Self { channel_id: channel_id.to_string(), host, started: Instant::now(), bytes: 0, outcome: "disconnected", stats }
  }

  fn record(&mut self, n: usize) {
    self.bytes += n as u64;
    self.stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
  }
}

impl Drop for ProxySession {
  fn drop(&mut self) {
    self.stats.active.fetch_sub(1, Ordering::Relaxed);
    info!(
      channel = %self.channel_id,
      host = %self.host,
      bytes = self.bytes,
      duration_ms = self.started.elapsed().as_millis() as u64,
      outcome = self.outcome,
      "proxy: session closed"
    );
  }
}

/// Copy `body` through, stopping at end of stream, on the first error or
/// when `shutdown` fires. Dropping the result drops the upstream body.
fn session_stream(body: ByteStream, session: ProxySession, shutdown: CancellationToken) -> ByteStream {
  futures::stream::unfold(Some((body, session, shutdown)), |state| async move {
    let (mut body, mut session, shutdown) = state?;
    tokio::select! {
      biased;
      () = shutdown.cancelled() => {
        session.outcome = "shutdown";
        None
      }
      next = body.next() => match next {
        Some(Ok(chunk)) => {
          session.record(chunk.len());
          Some((Ok(chunk), Some((body, session, shutdown))))
        }
        Some(Err(e)) => {
          session.outcome = "upstream error";
          session.stats.failures.fetch_add(1, Ordering::Relaxed);
          warn!(channel = %session.channel_id, err = %e, "proxy: upstream body failed");
          Some((Err(e), None))
        }
        None => {
          session.outcome = "complete";
          None
        }
      }
    }
  })
  .boxed()
}

struct CachedTarget {
  target: StreamTarget,
  resolved: Instant,
}

pub struct StreamProxy {
  upstream: Arc<dyn Upstream>,
  catalog: Arc<CatalogStore>,
  tokens: TokenCodec,
  api_url: String,
  proxy_content: bool,
  retry: RetryPolicy,
  target_ttl: Duration,
  targets: Mutex<HashMap<String, CachedTarget>>,
  stats: Arc<ProxyStats>,
  shutdown: CancellationToken,
}

impl StreamProxy {
  pub fn new(
    upstream: Arc<dyn Upstream>,
    catalog: Arc<CatalogStore>,
    api_url: impl Into<String>,
    proxy_content: bool,
    shutdown: CancellationToken,
  ) -> Self {
    Self {
      upstream,
      catalog,
      tokens: TokenCodec::random(),
      api_url: api_url.into(),
      proxy_content,
      retry: RetryPolicy::default(),
      target_ttl: constants().target_ttl(),
      targets: Mutex::new(HashMap::new()),
      stats: Arc::new(ProxyStats::default()),
      shutdown,
    }
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn stats(&self) -> StatsSnapshot {
    self.stats.snapshot()
  }

  fn channel(&self, id: &str) -> Result<Channel> {
    let snapshot = self.catalog.current().ok_or_else(|| Error::not_found("catalog not loaded yet"))?;
    snapshot.channel(id).cloned().ok_or_else(|| Error::not_found(format!("channel {id}")))
  }

  async fn target(&self, channel: &Channel) -> Result<StreamTarget> {
    if let Some(cached) = self.targets.lock().await.get(&channel.id)
      && cached.resolved.elapsed() < self.target_ttl
    {
      return Ok(cached.target.clone());
    }
    let target = self.retry.run("resolve", || self.upstream.resolve_stream(channel)).await?;
    self
      .targets
      .lock()
      .await
      .insert(channel.id.clone(), CachedTarget { target: target.clone(), resolved: Instant::now() });
    Ok(target)
  }

  async fn forget_target(&self, channel_id: &str) {
    self.targets.lock().await.remove(channel_id);
  }

  fn link(&self, channel_id: &str, kind: UriKind, absolute: &str) -> String {
    let token = self.tokens.encode(channel_id, absolute);
    match kind {
      UriKind::Manifest => format!("{}/stream/{channel_id}/m/{token}.m3u8", self.api_url),
      UriKind::Segment => format!("{}/stream/{channel_id}/s/{token}", self.api_url),
      UriKind::Key => format!("{}/stream/{channel_id}/k/{token}", self.api_url),
    }
  }

  fn rewrite(&self, channel_id: &str, base: &Url, body: &[u8]) -> Result<String> {
    if !hls::is_manifest(body) {
      return Err(Error::permanent("upstream manifest is not an HLS playlist"));
    }
    let text = String::from_utf8_lossy(body);
    let rewriter = Rewriter::new(base, self.proxy_content, |kind, url| self.link(channel_id, kind, url));
    self.stats.manifests.fetch_add(1, Ordering::Relaxed);
    Ok(rewriter.rewrite(&text))
  }

  fn decode(&self, channel_id: &str, token: &str) -> Result<Url> {
    let raw = self.tokens.decode(channel_id, token)?;
    Url::parse(&raw).map_err(|_| Error::not_found("invalid proxy token"))
  }

  fn failed<T>(&self, channel_id: &str, what: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
      self.stats.failures.fetch_add(1, Ordering::Relaxed);
      warn!(channel = channel_id, what, err = %e, "proxy: request failed");
    }
    result
  }

  /// Top-level manifest for a channel.
  pub async fn index(&self, channel_id: &str) -> Result<ProxyResponse> {
    let channel = self.channel(channel_id)?;
    let result = async {
      let target = self.target(&channel).await?;
      let url = target.manifest_url.clone();
      let body = self.retry.run("manifest", || self.upstream.fetch_manifest(&url, &target)).await?;
      self.rewrite(channel_id, &url, &body)
    }
    .await;
    if result.is_err() {
      // The cached target may be what went stale.
      self.forget_target(channel_id).await;
    }
    self.failed(channel_id, "index", result).map(ProxyResponse::Manifest)
  }

  /// A nested (variant or rendition) manifest.
  pub async fn manifest(&self, channel_id: &str, token: &str) -> Result<ProxyResponse> {
    let channel = self.channel(channel_id)?;
    let url = self.decode(channel_id, token.trim_end_matches(".m3u8"))?;
    let result = async {
      let target = self.target(&channel).await?;
      let body = self.retry.run("manifest", || self.upstream.fetch_manifest(&url, &target)).await?;
      self.rewrite(channel_id, &url, &body)
    }
    .await;
    self.failed(channel_id, "manifest", result).map(ProxyResponse::Manifest)
  }

  /// Decryption key, fetched with the target's Referer and Origin.
  pub async fn key(&self, channel_id: &str, token: &str) -> Result<ProxyResponse> {
    let channel = self.channel(channel_id)?;
    let url = self.decode(channel_id, token)?;
    let result = async {
      let target = self.target(&channel).await?;
      self.retry.run("key", || self.upstream.fetch_key(&url, &target)).await
    }
    .await;
    self
      .failed(channel_id, "key", result)
      .map(|body| ProxyResponse::Bytes { content_type: "application/octet-stream", body })
  }

  /// Media segment, streamed. A segment URL that serves a manifest is
  /// buffered and rewritten instead.
  pub async fn segment(&self, channel_id: &str, token: &str) -> Result<ProxyResponse> {
    let channel = self.channel(channel_id)?;
    let url = self.decode(channel_id, token)?;
    let result = async {
      let target = self.target(&channel).await?;
      self.retry.run("segment", || self.upstream.open_media(&url, &target)).await
    }
    .await;
    let media = self.failed(channel_id, "segment", result)?;

    if media.content_type.as_deref().is_some_and(|ct| ct.to_ascii_lowercase().contains("mpegurl")) {
      let body = collect_bounded(media).await?;
      return self.rewrite(channel_id, &url, &body).map(ProxyResponse::Manifest);
    }

    let session = ProxySession::open(channel_id, &url, self.stats.clone());
    Ok(ProxyResponse::Stream {
      content_type: media.content_type,
      content_length: media.content_length,
      body: session_stream(media.body, session, self.shutdown.clone()),
    })
  }
}

async fn collect_bounded(mut media: MediaStream) -> Result<Bytes> {
  let mut buf = BytesMut::new();
  while let Some(chunk) = media.body.next().await {
    buf.extend_from_slice(&chunk?);
    if buf.len() > MAX_INLINE_MANIFEST {
      return Err(Error::permanent("manifest response too large"));
    }
  }
  Ok(buf.freeze())
}
