//! Parsers for the provider's HTML pages and JSON schedule.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use tracing::debug;

use crate::catalog::{Channel, ChannelRef, RawEvent};

/// Standard alphabet, padding optional, like a forgiving `atob`.
const LENIENT_B64: GeneralPurpose = GeneralPurpose::new(
  &alphabet::STANDARD,
  GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_decode_allow_trailing_bits(true),
);

static CHANNEL_CARD: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r#"(?s)href="/watch\.php\?id=(\d+)"[^>]*>\s*<div class="card__title">(.*?)</div>"#).expect("valid regex")
});
static IFRAME_SRC: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r#"iframe src="([^"]*)" width"#).expect("valid regex"));
static CHANNEL_KEY: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r#"const\s+CHANNEL_KEY\s*=\s*"(.*?)";"#).expect("valid regex"));
static BUNDLE_CANDIDATES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
  [
    r#"JSON\.parse\s*\(\s*atob\s*\(\s*["']([^"']{40,})["']\s*\)\s*\)"#,
    r#"atob\s*\(\s*["'](eyJ[A-Za-z0-9+/=]{40,})["']\s*\)"#,
    r#"(?:const|let|var)\s+[A-Za-z_$][\w$]*\s*=\s*["'](eyJ[A-Za-z0-9+/=]{40,})["']"#,
    r#"["'](eyJ[A-Za-z0-9+/=]{40,})["']"#,
    r#"["']([A-Za-z0-9+/=]{80,})["']"#,
  ]
  .iter()
  .map(|p| Regex::new(p).expect("valid regex"))
  .collect()
});

// --- Channel list ---

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetaEntry {
  #[serde(default)]
  pub logo: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
}

/// Channel display metadata keyed by channel name.
pub type ChannelMeta = HashMap<String, MetaEntry>;

/// Parse the 24/7 channel page into channels in page order.
///
/// Repeated ids keep their first occurrence. Names are HTML-unescaped and
/// stripped of `#`.
pub fn parse_channels(html: &str, meta: &ChannelMeta, upstream_url: &str) -> Vec<Channel> {
  let mut seen = HashSet::new();
  let mut channels = Vec::new();
  for cap in CHANNEL_CARD.captures_iter(html) {
    let id = cap[1].to_string();
    if !seen.insert(id.clone()) {
      continue;
    }
    let raw = cap[2].trim();
    let name = quick_xml::escape::unescape(raw).map(|c| c.into_owned()).unwrap_or_else(|_| raw.to_string());
    let name = name.replace('#', "").trim().to_string();

    let meta_key = if name.starts_with("18+") { "18+" } else { name.as_str() };
    let entry = meta.get(meta_key).cloned().unwrap_or_default();
    let category = entry.tags.first().cloned().unwrap_or_else(|| "24/7".to_string());

    channels.push(Channel {
      stream_ref: format!("{upstream_url}/stream/stream-{id}.php"),
      id,
      name,
      logo_url: entry.logo.filter(|l| !l.is_empty()),
      category,
      tags: entry.tags,
    });
  }
  channels
}

// --- Schedule ---

/// Parse the `<date> - <label>` day heading of the schedule.
pub fn parse_day(key: &str) -> Option<NaiveDate> {
  let date = key.split(" - ").next()?.trim();
  for fmt in ["%d-%m-%Y", "%d/%m/%Y", "%d.%m.%Y", "%Y-%m-%d"] {
    if let Ok(d) = NaiveDate::parse_from_str(date, fmt) {
      return Some(d);
    }
  }

  // "Friday 18th Oct 2024" / "18th October 2024"
  let mut parts: Vec<&str> = date.split_whitespace().collect();
  if parts.len() == 4 {
    parts.remove(0);
  }
  if parts.len() != 3 {
    return None;
  }
  let day = parts[0].trim_end_matches(|c: char| c.is_ascii_alphabetic());
  let text = format!("{day} {} {}", parts[1], parts[2]);
  NaiveDate::parse_from_str(&text, "%d %b %Y").or_else(|_| NaiveDate::parse_from_str(&text, "%d %B %Y")).ok()
}

fn channel_refs(value: Option<&Value>) -> Vec<ChannelRef> {
  let items: Vec<&Value> = match value {
    Some(Value::Array(list)) => list.iter().collect(),
    Some(Value::Object(map)) => map.values().collect(),
    _ => return Vec::new(),
  };
  items
    .into_iter()
    .filter_map(|item| {
      let id = match item.get("channel_id")? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
      };
      let name = item.get("channel_name").and_then(Value::as_str).unwrap_or_default().trim().to_string();
      (!id.is_empty()).then_some(ChannelRef { id, name })
    })
    .collect()
}

/// Flatten the schedule document into events timed in `tz`.
pub fn parse_schedule(doc: &Map<String, Value>, tz: Tz, duration: Duration) -> Vec<RawEvent> {
  let mut events = Vec::new();
  for (day_key, categories) in doc {
    let Some(date) = parse_day(day_key) else {
      debug!(day = %day_key, "upstream: skipping unparseable schedule day");
      continue;
    };
    let Some(categories) = categories.as_object() else { continue };
    for (category, list) in categories {
      let Some(list) = list.as_array() else { continue };
      for item in list {
        let title = item.get("event").and_then(Value::as_str).unwrap_or_default().trim();
        let time = item.get("time").and_then(Value::as_str).unwrap_or_default().trim();
        let Ok(time) = NaiveTime::parse_from_str(time, "%H:%M") else {
          debug!(event = %title, time = %time, "upstream: skipping event with bad time");
          continue;
        };
        if title.is_empty() {
          continue;
        }
        // Nonexistent local times (DST gaps) are skipped.
        let Some(start) = tz.from_local_datetime(&date.and_time(time)).earliest() else { continue };
        let start = start.with_timezone(&Utc);

        let mut refs = channel_refs(item.get("channels"));
        refs.extend(channel_refs(item.get("channels2")));

        events.push(RawEvent {
          title: title.to_string(),
          category: category.clone(),
          start,
          end: start + duration,
          refs,
        });
      }
    }
  }
  // Stable, so same-minute events keep document order.
  events.sort_by_key(|e| e.start);
  events
}

// --- Stream page scraping ---

pub fn extract_iframe_src(html: &str) -> Option<String> {
  IFRAME_SRC.captures(html).map(|c| c[1].to_string())
}

/// The last `const CHANNEL_KEY = "..."` in the player page.
pub fn extract_channel_key(html: &str) -> Option<String> {
  CHANNEL_KEY.captures_iter(html).last().map(|c| c[1].to_string())
}

/// Auth parameters embedded in the player page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthBundle {
  pub ts: String,
  pub sig: String,
  pub rnd: String,
  pub host: String,
}

fn b64_text(s: &str) -> Option<String> {
  LENIENT_B64.decode(s.trim()).ok().and_then(|b| String::from_utf8(b).ok())
}

fn parse_candidate(candidate: &str) -> Option<Map<String, Value>> {
  let decoded = b64_text(candidate)?;
  let Value::Object(map) = serde_json::from_str::<Value>(&decoded).ok()? else { return None };
  ["b_ts", "b_sig", "b_host", "b_rnd"].iter().any(|k| map.contains_key(*k)).then_some(map)
}

/// Decode string values that are themselves base64, leaving the rest as is.
fn normalize_bundle(map: Map<String, Value>) -> Map<String, Value> {
  map
    .into_iter()
    .map(|(k, v)| match v {
      Value::String(s) => {
        let decoded = b64_text(&s).unwrap_or(s);
        (k, Value::String(decoded))
      }
      other => (k, other),
    })
    .collect()
}

/// Locate and decode the base64 JSON auth bundle in a player page.
pub fn decode_bundle(html: &str) -> Option<Map<String, Value>> {
  let whole = html.trim();
  if let Some(map) = parse_candidate(whole) {
    return Some(normalize_bundle(map));
  }
  for re in BUNDLE_CANDIDATES.iter() {
    for cap in re.captures_iter(html) {
      if let Some(map) = parse_candidate(&cap[1]) {
        return Some(normalize_bundle(map));
      }
    }
  }
  None
}

impl AuthBundle {
  pub fn from_page(html: &str) -> Option<Self> {
    let map = decode_bundle(html)?;
    let field = |k: &str| map.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
    let bundle = Self { ts: field("b_ts"), sig: field("b_sig"), rnd: field("b_rnd"), host: field("b_host") };
    (!bundle.host.is_empty()).then_some(bundle)
  }
}

/// Manifest URL for a resolved server key.
pub fn server_url(server_key: &str, channel_key: &str, template: &str, top1_template: &str) -> String {
  let template = if server_key == "top1/cdn" { top1_template } else { template };
  template.replace("{server_key}", server_key).replace("{channel_key}", channel_key)
}
