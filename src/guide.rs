//! XMLTV guide rendering and publication.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use quick_xml::escape::escape;
use std::collections::HashSet;
use std::fmt::Write;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::catalog::{CatalogSnapshot, Channel};
use crate::config::{AppConfig, GuideExcluded};
use crate::playlist::logo_url;
use crate::selection::{SelectionRecord, write_atomic};

const XMLTV_TIME: &str = "%Y%m%d%H%M%S %z";

/// Renders a snapshot into an XMLTV document.
#[derive(Debug, Clone)]
pub struct GuideRenderer {
  timezone: Tz,
  api_url: String,
  excluded: GuideExcluded,
}

impl GuideRenderer {
  pub fn new(timezone: Tz, api_url: impl Into<String>, excluded: GuideExcluded) -> Self {
    Self { timezone, api_url: api_url.into(), excluded }
  }

  pub fn from_config(config: &AppConfig) -> Self {
    Self::new(config.timezone, config.api_url.clone(), config.guide_excluded)
  }

  fn channels<'a>(&self, snapshot: &'a CatalogSnapshot, selection: &SelectionRecord) -> Vec<&'a Channel> {
    snapshot
      .channels()
      .iter()
      .filter(|c| self.excluded == GuideExcluded::Include || selection.is_included(&c.id))
      .collect()
  }

  /// One `<programme>` per event and listed channel, in snapshot order.
  pub fn render(&self, snapshot: &CatalogSnapshot, selection: &SelectionRecord) -> String {
    let channels = self.channels(snapshot, selection);
    let listed: HashSet<&str> = channels.iter().map(|c| c.id.as_str()).collect();

    let mut out = String::with_capacity(256 + channels.len() * 200 + snapshot.events().len() * 300);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<!DOCTYPE tv SYSTEM \"xmltv.dtd\">\n");
    out.push_str("<tv generator-info-name=\"dlhd-proxy\">\n");

    for channel in &channels {
      let _ = writeln!(out, "  <channel id=\"{}\">", escape(channel.id.as_str()));
      let _ = writeln!(out, "    <display-name>{}</display-name>", escape(channel.name.as_str()));
      if let Some(logo) = &channel.logo_url {
        let _ = writeln!(out, "    <icon src=\"{}\" />", escape(logo_url(&self.api_url, logo).as_str()));
      }
      out.push_str("  </channel>\n");
    }

    let mut programmes = 0usize;
    for event in snapshot.events() {
      let start = event.start.with_timezone(&self.timezone).format(XMLTV_TIME);
      let stop = event.end.with_timezone(&self.timezone).format(XMLTV_TIME);
      for id in event.channel_ids.iter().filter(|id| listed.contains(id.as_str())) {
        let _ = writeln!(out, "  <programme start=\"{start}\" stop=\"{stop}\" channel=\"{}\">", escape(id.as_str()));
        let _ = writeln!(out, "    <title lang=\"en\">{}</title>", escape(event.title.as_str()));
        if !event.category.is_empty() {
          let _ = writeln!(out, "    <category lang=\"en\">{}</category>", escape(event.category.as_str()));
        }
        out.push_str("  </programme>\n");
        programmes += 1;
      }
    }
    out.push_str("</tv>\n");

    info!(channels = channels.len(), programmes, "guide: rendered");
    out
  }
}

/// Holds the last successfully published guide and mirrors it to disk.
pub struct GuidePublisher {
  path: PathBuf,
  tx: watch::Sender<Option<Bytes>>,
  published_at: watch::Sender<Option<DateTime<Utc>>>,
}

impl GuidePublisher {
  /// Start from the on-disk cache, if any.
  pub async fn load(path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    let (doc, at) = match tokio::fs::read(&path).await {
      Ok(bytes) if !bytes.is_empty() => {
        let at = tokio::fs::metadata(&path).await.and_then(|m| m.modified()).ok().map(DateTime::<Utc>::from);
        info!(path = %path.display(), bytes = bytes.len(), "guide: loaded cached document");
        (Some(Bytes::from(bytes)), at)
      }
      Ok(_) => (None, None),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => (None, None),
      Err(e) => {
        warn!(path = %path.display(), err = %e, "guide: cannot read cached document");
        (None, None)
      }
    };
    let (tx, _) = watch::channel(doc);
    let (published_at, _) = watch::channel(at);
    Self { path, tx, published_at }
  }

  /// The document to serve, or `None` before anything was ever published.
  pub fn current(&self) -> Option<Bytes> {
    self.tx.borrow().clone()
  }

  pub fn published_at(&self) -> Option<DateTime<Utc>> {
    *self.published_at.borrow()
  }

  /// Swap in a freshly rendered document. A failing disk mirror is logged
  /// but the new document is still served.
  pub async fn publish(&self, document: String, at: DateTime<Utc>) {
    let bytes = Bytes::from(document);
    if let Err(e) = write_atomic(&self.path, &bytes).await {
      warn!(path = %self.path.display(), err = %e, "guide: failed to write cache");
    }
    let len = bytes.len();
    self.tx.send_replace(Some(bytes));
    self.published_at.send_replace(Some(at));
    info!(bytes = len, "guide: published");
  }
}
