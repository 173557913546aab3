//! Channel logos, fetched once and kept on disk.

use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::catalog::CatalogStore;
use crate::error::{Error, Result};
use crate::selection::write_atomic;
use crate::token::decode_plain;
use crate::upstream::Upstream;

pub struct LogoCache {
  dir: PathBuf,
  upstream: Arc<dyn Upstream>,
  catalog: Arc<CatalogStore>,
}

impl LogoCache {
  pub fn new(dir: impl Into<PathBuf>, upstream: Arc<dyn Upstream>, catalog: Arc<CatalogStore>) -> Self {
    Self { dir: dir.into(), upstream, catalog }
  }

  /// Serve the logo behind `reference`, which must name a logo of a channel
  /// in the current snapshot.
  pub async fn get(&self, reference: &str) -> Result<(&'static str, Bytes)> {
    let raw = decode_plain(reference)?;
    let known = self
      .catalog
      .current()
      .is_some_and(|s| s.channels().iter().any(|c| c.logo_url.as_deref() == Some(raw.as_str())));
    if !known {
      return Err(Error::not_found("logo"));
    }
    let url = Url::parse(&raw).map_err(|_| Error::not_found("logo"))?;
    let name = file_name(&url);
    let path = self.dir.join(&name);
    let content_type = content_type(&name);

    if let Ok(bytes) = tokio::fs::read(&path).await {
      debug!(logo = %name, "logo: cache hit");
      return Ok((content_type, Bytes::from(bytes)));
    }

    let bytes = self.upstream.fetch_logo(&url).await?;
    if let Err(e) = write_atomic(&path, &bytes).await {
      warn!(logo = %name, err = %e, "logo: failed to cache");
    }
    Ok((content_type, bytes))
  }
}

/// Last path segment, restricted to a safe character set.
fn file_name(url: &Url) -> String {
  let last = url.path_segments().and_then(|mut s| s.next_back()).unwrap_or_default();
  let clean: String =
    last.chars().map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' }).collect();
  let clean = clean.trim_start_matches('.');
  if clean.is_empty() { "logo".to_string() } else { clean.to_string() }
}

fn content_type(name: &str) -> &'static str {
  let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()).unwrap_or_default();
  match ext.as_str() {
    "png" => "image/png",
    "jpg" | "jpeg" => "image/jpeg",
    "gif" => "image/gif",
    "svg" => "image/svg+xml",
    "webp" => "image/webp",
    _ => "application/octet-stream",
  }
}
