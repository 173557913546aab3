use std::fmt::Write;

use crate::catalog::{CatalogSnapshot, Channel};
use crate::selection::{SelectionRecord, effective_channels};
use crate::token::encode_plain;

/// Proxy-relative stream URL for a channel.
pub fn stream_url(api_url: &str, channel_id: &str) -> String {
  format!("{api_url}/stream/{channel_id}/index.m3u8")
}

/// Proxy-relative logo URL.
pub fn logo_url(api_url: &str, upstream_logo: &str) -> String {
  format!("{api_url}/logo/{}", encode_plain(upstream_logo))
}

/// Render the effective channel set as an extended M3U playlist.
///
/// Entries follow snapshot order, so identical inputs give identical bytes.
pub fn render(snapshot: &CatalogSnapshot, selection: &SelectionRecord, api_url: &str) -> String {
  let channels = effective_channels(snapshot, selection);
  let mut out = String::with_capacity(64 + channels.len() * 160);
  let _ = writeln!(out, "#EXTM3U url-tvg=\"{api_url}/guide.xml\"");
  for channel in channels {
    write_entry(&mut out, channel, api_url);
  }
  out
}

fn write_entry(out: &mut String, channel: &Channel, api_url: &str) {
  let name = attr(&channel.name);
  let _ = write!(out, "#EXTINF:-1 tvg-id=\"{}\" tvg-name=\"{name}\"", attr(&channel.id));
  if let Some(logo) = &channel.logo_url {
    let _ = write!(out, " tvg-logo=\"{}\"", logo_url(api_url, logo));
  }
  let _ = writeln!(out, " group-title=\"{}\",{}", attr(&channel.category), line(&channel.name));
  let _ = writeln!(out, "{}", stream_url(api_url, &channel.id));
}

/// Attribute values cannot carry quotes or line breaks.
fn attr(s: &str) -> String {
  s.chars().filter(|c| !matches!(c, '"' | '\r' | '\n')).collect()
}

fn line(s: &str) -> String {
  s.chars().filter(|c| !matches!(c, '\r' | '\n')).collect()
}
