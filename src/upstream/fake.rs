//! Scriptable in-memory upstream for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, stream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use super::{MediaStream, StreamTarget, Upstream};
use crate::catalog::{CatalogSnapshot, Channel, Event};
use crate::error::{Error, Result};

pub const MEDIA_MANIFEST: &str = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n#EXTINF:4.0,\nseg1.ts\n";

#[derive(Default)]
pub struct FakeUpstream {
  pub channels: Mutex<Vec<Channel>>,
  pub events: Mutex<Vec<Event>>,
  pub catalog_fails: AtomicBool,
  pub events_fail: AtomicBool,
  /// Transient failures to return before a manifest fetch succeeds.
  pub manifest_failures: AtomicU32,
  pub manifest_permanent: AtomicBool,
  pub manifest_calls: AtomicU32,
  pub resolve_calls: AtomicU32,
  pub catalog_calls: AtomicU32,
  pub events_calls: AtomicU32,
  /// Manifest bodies by URL; anything else gets [`MEDIA_MANIFEST`].
  pub manifests: Mutex<HashMap<String, String>>,
  pub media_content_type: Mutex<Option<String>>,
  pub media_body: Mutex<Option<Vec<u8>>>,
  /// Set once a media body handed out by `open_media` has been dropped.
  pub media_dropped: Arc<AtomicBool>,
}

impl FakeUpstream {
  pub fn with_channels(channels: Vec<Channel>) -> Self {
    Self { channels: Mutex::new(channels), ..Self::default() }
  }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
  fn drop(&mut self) {
    self.0.store(true, Ordering::SeqCst);
  }
}

#[async_trait]
impl Upstream for FakeUpstream {
  async fn fetch_catalog(&self) -> Result<CatalogSnapshot> {
    self.catalog_calls.fetch_add(1, Ordering::SeqCst);
    if self.catalog_fails.load(Ordering::SeqCst) {
      return Err(Error::transient("catalog unavailable"));
    }
    Ok(CatalogSnapshot::new(self.channels.lock().unwrap().clone(), Vec::new(), Utc::now()))
  }

  async fn fetch_events(&self, _channels: &[Channel]) -> Result<Vec<Event>> {
    self.events_calls.fetch_add(1, Ordering::SeqCst);
    if self.events_fail.load(Ordering::SeqCst) {
      return Err(Error::permanent("schedule malformed"));
    }
    Ok(self.events.lock().unwrap().clone())
  }

  async fn resolve_stream(&self, channel: &Channel) -> Result<StreamTarget> {
    self.resolve_calls.fetch_add(1, Ordering::SeqCst);
    Ok(StreamTarget {
      channel_id: channel.id.clone(),
      manifest_url: Url::parse(&format!("https://edge.upstream.test/{}/mono.m3u8", channel.id)).unwrap(),
      referer: "https://player.upstream.test/".into(),
      origin: "https://player.upstream.test".into(),
    })
  }

  async fn fetch_manifest(&self, url: &Url, _target: &StreamTarget) -> Result<Bytes> {
    self.manifest_calls.fetch_add(1, Ordering::SeqCst);
    if self.manifest_permanent.load(Ordering::SeqCst) {
      return Err(Error::permanent("HTTP 404"));
    }
    let pending = self.manifest_failures.load(Ordering::SeqCst);
    if pending > 0 {
      self.manifest_failures.store(pending - 1, Ordering::SeqCst);
      return Err(Error::transient("HTTP 503"));
    }
    let body = self.manifests.lock().unwrap().get(url.as_str()).cloned().unwrap_or_else(|| MEDIA_MANIFEST.to_string());
    Ok(Bytes::from(body))
  }

  async fn fetch_key(&self, _url: &Url, _target: &StreamTarget) -> Result<Bytes> {
    Ok(Bytes::from_static(&[7u8; 16]))
  }

  async fn open_media(&self, _url: &Url, _target: &StreamTarget) -> Result<MediaStream> {
    let content_type = self.media_content_type.lock().unwrap().clone();
    let flag = DropFlag(self.media_dropped.clone());
    let body = match self.media_body.lock().unwrap().clone() {
      // A finite body, returned in one chunk.
      Some(bytes) => stream::iter([Ok(Bytes::from(bytes))]).map(move |c| {
        let _held = &flag;
        c
      }).boxed(),
      // A live-like body: one chunk, then nothing until dropped.
      None => stream::iter([Ok(Bytes::from_static(&[0x47u8; 188]))])
        .chain(stream::pending())
        .map(move |c| {
          let _held = &flag;
          c
        })
        .boxed(),
    };
    Ok(MediaStream { content_type, content_length: None, body })
  }

  async fn fetch_logo(&self, _url: &Url) -> Result<Bytes> {
    Ok(Bytes::from_static(b"\x89PNG"))
  }
}
