//! Client for the external schedule/stream provider.
//!
//! Every call goes through one shared `reqwest::Client` (optionally tunnelled
//! through a SOCKS5 relay), carries a bounded timeout and holds a permit from
//! a shared semaphore so the number of simultaneous upstream fetches is capped.

#[cfg(test)]
pub(crate) mod fake;
pub mod retry;
pub mod scrape;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, ORIGIN, REFERER};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

use crate::catalog::{CatalogSnapshot, Channel, ChannelResolver, Event, enumerate_duplicate_names, sort_channels};
use crate::config::AppConfig;
use crate::constants::constants;
use crate::error::{Error, Result, redact};
use scrape::{AuthBundle, ChannelMeta};

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Where a channel's live manifest lives, plus the headers upstream insists on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
  pub channel_id: String,
  pub manifest_url: Url,
  pub referer: String,
  pub origin: String,
}

/// A media body being streamed from upstream.
pub struct MediaStream {
  pub content_type: Option<String>,
  pub content_length: Option<u64>,
  pub body: ByteStream,
}

impl std::fmt::Debug for MediaStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MediaStream")
      .field("content_type", &self.content_type)
      .field("content_length", &self.content_length)
      .finish_non_exhaustive()
  }
}

#[async_trait]
pub trait Upstream: Send + Sync {
  /// Current channel list as a snapshot without events.
  async fn fetch_catalog(&self) -> Result<CatalogSnapshot>;

  /// Scheduled events, with channel references resolved against `channels`.
  async fn fetch_events(&self, channels: &[Channel]) -> Result<Vec<Event>>;

  async fn resolve_stream(&self, channel: &Channel) -> Result<StreamTarget>;

  async fn fetch_manifest(&self, url: &Url, target: &StreamTarget) -> Result<Bytes>;

  async fn fetch_key(&self, url: &Url, target: &StreamTarget) -> Result<Bytes>;

  /// Start streaming a media segment. The body is not buffered.
  async fn open_media(&self, url: &Url, target: &StreamTarget) -> Result<MediaStream>;

  async fn fetch_logo(&self, url: &Url) -> Result<Bytes>;
}

pub struct HttpUpstream {
  client: Client,
  base_url: String,
  timezone: Tz,
  meta: ChannelMeta,
  limiter: Arc<Semaphore>,
  server_template: String,
  top1_template: String,
}

impl HttpUpstream {
  pub fn new(config: &AppConfig, meta: ChannelMeta) -> Result<Self> {
    let c = constants();
    let mut builder = Client::builder()
      .user_agent(c.user_agent.as_str())
      .connect_timeout(c.connect_timeout())
      .pool_max_idle_per_host(c.pool_idle_per_host);
    if let Some(relay) = &config.socks5 {
      // socks5h: let the relay resolve hostnames too.
      let proxy = reqwest::Proxy::all(format!("socks5h://{relay}"))
        .map_err(|e| Error::Configuration(format!("invalid SOCKS5 relay '{relay}': {e}")))?;
      builder = builder.proxy(proxy);
      info!(relay = %relay, "upstream: routing through SOCKS5 relay");
    }
    let client = builder.build().map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;

    Ok(Self {
      client,
      base_url: config.upstream_url.clone(),
      timezone: config.timezone,
      meta,
      limiter: Arc::new(Semaphore::new(c.upstream_concurrency)),
      server_template: c.stream_server_template.clone(),
      top1_template: c.top1_server_template.clone(),
    })
  }

  #[cfg(test)]
  fn with_server_templates(mut self, template: &str, top1: &str) -> Self {
    self.server_template = template.to_string();
    self.top1_template = top1.to_string();
    self
  }

  /// Load the optional channel metadata file. Problems are logged, not fatal.
  pub fn load_meta(path: Option<&std::path::Path>) -> ChannelMeta {
    let Some(path) = path else { return ChannelMeta::new() };
    match std::fs::read_to_string(path).map(|s| serde_json::from_str::<ChannelMeta>(&s)) {
      Ok(Ok(meta)) => {
        info!(path = %path.display(), entries = meta.len(), "upstream: loaded channel metadata");
        meta
      }
      Ok(Err(e)) => {
        warn!(path = %path.display(), err = %e, "upstream: channel metadata is not valid JSON");
        ChannelMeta::new()
      }
      Err(e) => {
        warn!(path = %path.display(), err = %e, "upstream: cannot read channel metadata");
        ChannelMeta::new()
      }
    }
  }

  #[cfg(test)]
  fn with_concurrency(mut self, permits: usize) -> Self {
    self.limiter = Arc::new(Semaphore::new(permits));
    self
  }

  #[cfg(test)]
  fn limiter(&self) -> Arc<Semaphore> {
    self.limiter.clone()
  }

  async fn permit(&self) -> Result<OwnedSemaphorePermit> {
    self.limiter.clone().acquire_owned().await.map_err(|_| Error::transient("upstream limiter closed"))
  }

  /// GET with headers and timeout; non-success statuses become classified errors.
  async fn send(&self, url: &str, referer: &str, origin: Option<&str>, timeout: Duration) -> Result<reqwest::Response> {
    let mut request = self.client.get(url).header(REFERER, referer).timeout(timeout);
    if let Some(origin) = origin {
      request = request.header(ORIGIN, origin);
    }
    let response = request.send().await.map_err(|e| {
      debug!(url = %redact(url), err = %e, "upstream: request failed");
      Error::from(e)
    })?;
    let status = response.status();
    if !status.is_success() {
      warn!(url = %redact(url), status = status.as_u16(), "upstream: request returned error status");
      return Err(Error::from_status(status, url));
    }
    debug!(url = %redact(url), status = status.as_u16(), "upstream: request succeeded");
    Ok(response)
  }

  async fn get_text(&self, url: &str, referer: &str) -> Result<String> {
    let _permit = self.permit().await?;
    let response = self.send(url, referer, None, constants().request_timeout()).await?;
    Ok(response.text().await?)
  }

  async fn get_bytes(&self, url: &str, referer: &str, origin: Option<&str>) -> Result<Bytes> {
    let _permit = self.permit().await?;
    let response = self.send(url, referer, origin, constants().request_timeout()).await?;
    Ok(response.bytes().await?)
  }

  fn home(&self) -> String {
    format!("{}/", self.base_url)
  }
}

#[async_trait]
impl Upstream for HttpUpstream {
  async fn fetch_catalog(&self) -> Result<CatalogSnapshot> {
    let url = format!("{}/24-7-channels.php", self.base_url);
    let html = self.get_text(&url, &self.home()).await?;
    let mut channels = scrape::parse_channels(&html, &self.meta, &self.base_url);
    if channels.is_empty() {
      return Err(Error::permanent("channel page contained no channels"));
    }
    enumerate_duplicate_names(&mut channels);
    sort_channels(&mut channels);
    info!(channels = channels.len(), "upstream: loaded channels");
    Ok(CatalogSnapshot::new(channels, Vec::new(), Utc::now()))
  }

  async fn fetch_events(&self, channels: &[Channel]) -> Result<Vec<Event>> {
    let url = format!("{}/schedule/schedule-generated.php", self.base_url);
    let body = self.get_bytes(&url, &self.home(), None).await?;
    let doc: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&body)?;
    let duration = ChronoDuration::minutes(constants().event_duration_mins);
    let raw = scrape::parse_schedule(&doc, self.timezone, duration);
    let events = ChannelResolver::new(channels).resolve_events(raw);
    info!(events = events.len(), "upstream: loaded schedule");
    Ok(events)
  }

  async fn resolve_stream(&self, channel: &Channel) -> Result<StreamTarget> {
    let page_url = &channel.stream_ref;
    let page = self.get_text(page_url, &self.home()).await?;
    let source_url =
      scrape::extract_iframe_src(&page).ok_or_else(|| Error::permanent("stream page has no player iframe"))?;
    let source = Url::parse(&source_url).map_err(|e| Error::permanent(format!("bad player URL: {e}")))?;
    let origin = source.origin().ascii_serialization();

    let player = self.get_text(source.as_str(), page_url).await?;
    let channel_key =
      scrape::extract_channel_key(&player).ok_or_else(|| Error::permanent("player page has no channel key"))?;
    let bundle = AuthBundle::from_page(&player).ok_or_else(|| Error::permanent("player page has no auth bundle"))?;

    let mut auth = Url::parse(&format!("{}auth.php", bundle.host))
      .map_err(|e| Error::permanent(format!("bad auth host: {e}")))?;
    auth
      .query_pairs_mut()
      .append_pair("channel_id", &channel_key)
      .append_pair("ts", &bundle.ts)
      .append_pair("rnd", &bundle.rnd)
      .append_pair("sig", &bundle.sig);
    self.get_bytes(auth.as_str(), source.as_str(), None).await?;

    let lookup = format!("{origin}/server_lookup.php?channel_id={channel_key}");
    let body = self.get_bytes(&lookup, source.as_str(), None).await?;
    let value: serde_json::Value = serde_json::from_slice(&body)?;
    let server_key = value
      .get("server_key")
      .and_then(serde_json::Value::as_str)
      .filter(|s| !s.is_empty())
      .ok_or_else(|| Error::permanent("server lookup returned no server key"))?;

    let manifest = scrape::server_url(server_key, &channel_key, &self.server_template, &self.top1_template);
    let manifest_url = Url::parse(&manifest).map_err(|e| Error::permanent(format!("bad manifest URL: {e}")))?;
    info!(channel = %channel.id, host = manifest_url.host_str().unwrap_or_default(), "upstream: resolved stream");

    Ok(StreamTarget { channel_id: channel.id.clone(), manifest_url, referer: source.to_string(), origin })
  }

  async fn fetch_manifest(&self, url: &Url, target: &StreamTarget) -> Result<Bytes> {
    self.get_bytes(url.as_str(), &target.referer, Some(&target.origin)).await
  }

  async fn fetch_key(&self, url: &Url, target: &StreamTarget) -> Result<Bytes> {
    let referer = format!("{}/", target.origin);
    self.get_bytes(url.as_str(), &referer, Some(&target.origin)).await
  }

  async fn open_media(&self, url: &Url, target: &StreamTarget) -> Result<MediaStream> {
    let permit = self.permit().await?;
    let response = self.send(url.as_str(), &target.referer, Some(&target.origin), constants().media_timeout()).await?;
    let content_type = response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string);
    let content_length = response.content_length();
    // The permit rides along with the body and is released when it is dropped.
    let body = response
      .bytes_stream()
      .map(move |chunk| {
        let _held = &permit;
        chunk.map_err(Error::from)
      })
      .boxed();
    Ok(MediaStream { content_type, content_length, body })
  }

  async fn fetch_logo(&self, url: &Url) -> Result<Bytes> {
    self.get_bytes(url.as_str(), &self.home(), None).await
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::config::Settings;
  use base64::Engine as _;
  use wiremock::matchers::{method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn upstream_for(server: &MockServer) -> HttpUpstream {
    let settings = Settings { upstream_url: server.uri(), ..Settings::default() };
    HttpUpstream::new(&settings.resolve().unwrap(), ChannelMeta::new()).unwrap()
  }

  #[tokio::test]
  async fn fetch_catalog_scrapes_enumerates_and_sorts() {
    let server = MockServer::start().await;
    let html = r#"
      <a href="/watch.php?id=3"><div class="card__title">18+ Late</div></a>
      <a href="/watch.php?id=1"><div class="card__title">MLB League Pass</div></a>
      <a href="/watch.php?id=2"><div class="card__title">MLB League Pass</div></a>
      <a href="/watch.php?id=4"><div class="card__title">ABC</div></a>"#;
    Mock::given(method("GET"))
      .and(path("/24-7-channels.php"))
      .respond_with(ResponseTemplate::new(200).set_body_string(html))
      .mount(&server)
      .await;

    let snapshot = upstream_for(&server).fetch_catalog().await.unwrap();
    let names: Vec<_> = snapshot.channels().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["ABC", "MLB League Pass (1)", "MLB League Pass (2)", "18+ Late"]);
    assert!(snapshot.events().is_empty());
  }

  #[tokio::test]
  async fn status_errors_are_classified() {
    let server = MockServer::start().await;
    Mock::given(path("/24-7-channels.php")).respond_with(ResponseTemplate::new(503)).mount(&server).await;
    Mock::given(path("/schedule/schedule-generated.php")).respond_with(ResponseTemplate::new(404)).mount(&server).await;

    let upstream = upstream_for(&server);
    assert!(upstream.fetch_catalog().await.unwrap_err().is_transient());
    let err = upstream.fetch_events(&[]).await.unwrap_err();
    assert!(matches!(err, Error::UpstreamPermanent(_)));
  }

  #[tokio::test]
  async fn malformed_schedule_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(path("/schedule/schedule-generated.php"))
      .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
      .mount(&server)
      .await;
    assert!(matches!(upstream_for(&server).fetch_events(&[]).await, Err(Error::UpstreamPermanent(_))));
  }

  /// Mounts the stream page, player page, auth and server lookup for
  /// channel 51, which resolves to `{server}/wind/premium51/mono.m3u8`.
  pub(crate) async fn resolvable_channel(server: &MockServer) -> (HttpUpstream, Channel) {
    let base = server.uri();
    let std_b64 = base64::engine::general_purpose::STANDARD;
    let bundle = serde_json::json!({
      "b_ts": std_b64.encode("1700000000"),
      "b_rnd": std_b64.encode("r4nd"),
      "b_sig": std_b64.encode("s1g"),
      "b_host": std_b64.encode(format!("{base}/auth/")),
    });
    let encoded = std_b64.encode(bundle.to_string());

    Mock::given(path("/stream/stream-51.php"))
      .respond_with(
        ResponseTemplate::new(200).set_body_string(format!(r#"<iframe src="{base}/player/51" width="100%">"#)),
      )
      .mount(server)
      .await;
    Mock::given(path("/player/51"))
      .respond_with(ResponseTemplate::new(200).set_body_string(format!(
        r#"<script>const CHANNEL_KEY = "premium51"; var b = JSON.parse(atob("{encoded}"));</script>"#
      )))
      .mount(server)
      .await;
    Mock::given(path("/auth/auth.php"))
      .and(query_param("channel_id", "premium51"))
      .and(query_param("ts", "1700000000"))
      .and(query_param("sig", "s1g"))
      .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
      .expect(1)
      .mount(server)
      .await;
    Mock::given(path("/server_lookup.php"))
      .and(query_param("channel_id", "premium51"))
      .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"server_key":"wind"}"#))
      .mount(server)
      .await;

    let upstream = upstream_for(server)
      .with_server_templates(&format!("{base}/{{server_key}}/{{channel_key}}/mono.m3u8"), "http://unused.invalid/");
    let channel = Channel {
      id: "51".into(),
      name: "Fifty One".into(),
      logo_url: None,
      category: "24/7".into(),
      tags: vec![],
      stream_ref: format!("{base}/stream/stream-51.php"),
    };
    (upstream, channel)
  }

  #[tokio::test]
  async fn resolve_stream_follows_the_auth_chain() {
    let server = MockServer::start().await;
    let base = server.uri();
    let (upstream, channel) = resolvable_channel(&server).await;
    let target = upstream.resolve_stream(&channel).await.unwrap();
    assert_eq!(target.channel_id, "51");
    assert_eq!(target.manifest_url.as_str(), format!("{base}/wind/premium51/mono.m3u8"));
    assert_eq!(target.referer, format!("{base}/player/51"));
    assert_eq!(target.origin, base);
  }

  #[tokio::test]
  async fn resolve_stream_without_iframe_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(path("/stream/stream-9.php"))
      .respond_with(ResponseTemplate::new(200).set_body_string("<p>offline</p>"))
      .mount(&server)
      .await;
    let channel = Channel {
      id: "9".into(),
      name: "Nine".into(),
      logo_url: None,
      category: "24/7".into(),
      tags: vec![],
      stream_ref: format!("{}/stream/stream-9.php", server.uri()),
    };
    let err = upstream_for(&server).resolve_stream(&channel).await.unwrap_err();
    assert!(matches!(err, Error::UpstreamPermanent(_)));
  }

  #[tokio::test]
  async fn media_permit_is_released_when_body_dropped() {
    let server = MockServer::start().await;
    Mock::given(path("/seg.ts"))
      .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x47u8; 4096]).insert_header("content-type", "video/mp2t"))
      .mount(&server)
      .await;
    let upstream = upstream_for(&server);
    let limiter = upstream.limiter();
    let before = limiter.available_permits();
    let target = StreamTarget {
      channel_id: "1".into(),
      manifest_url: Url::parse(&format!("{}/mono.m3u8", server.uri())).unwrap(),
      referer: server.uri(),
      origin: server.uri(),
    };
    let media = upstream.open_media(&Url::parse(&format!("{}/seg.ts", server.uri())).unwrap(), &target).await.unwrap();
    assert_eq!(media.content_type.as_deref(), Some("video/mp2t"));
    assert_eq!(limiter.available_permits(), before - 1);
    drop(media);
    assert_eq!(limiter.available_permits(), before);
  }

  #[tokio::test]
  async fn concurrency_cap_holds_extra_callers_until_a_permit_frees() {
    let server = MockServer::start().await;
    Mock::given(path("/seg.ts"))
      .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x47u8; 188]))
      .mount(&server)
      .await;
    Mock::given(path("/mono.m3u8"))
      .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\n"))
      .mount(&server)
      .await;
    let upstream = upstream_for(&server).with_concurrency(2);
    let target = StreamTarget {
      channel_id: "1".into(),
      manifest_url: Url::parse(&format!("{}/mono.m3u8", server.uri())).unwrap(),
      referer: server.uri(),
      origin: server.uri(),
    };
    let seg = Url::parse(&format!("{}/seg.ts", server.uri())).unwrap();

    let first = upstream.open_media(&seg, &target).await.unwrap();
    let _second = upstream.open_media(&seg, &target).await.unwrap();
    assert_eq!(upstream.limiter().available_permits(), 0);

    let waiting = tokio::time::timeout(Duration::from_millis(200), upstream.fetch_manifest(&target.manifest_url, &target));
    assert!(waiting.await.is_err(), "third caller got through a full limiter");

    drop(first);
    let body = tokio::time::timeout(Duration::from_secs(5), upstream.fetch_manifest(&target.manifest_url, &target))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&body[..], b"#EXTM3U\n");
  }
}
