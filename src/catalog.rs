//! Channels, scheduled events and the copy-on-write snapshot store.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
  pub id: String,
  pub name: String,
  pub logo_url: Option<String>,
  pub category: String,
  pub tags: Vec<String>,
  /// Upstream page the stream is resolved from. Never rendered to clients.
  pub stream_ref: String,
}

/// A channel reference as it appears in the upstream schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef {
  pub id: String,
  pub name: String,
}

/// A schedule entry before its channel references are resolved.
#[derive(Debug, Clone)]
pub struct RawEvent {
  pub title: String,
  pub category: String,
  pub start: DateTime<Utc>,
  pub end: DateTime<Utc>,
  pub refs: Vec<ChannelRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
  pub id: String,
  pub title: String,
  pub category: String,
  pub start: DateTime<Utc>,
  pub end: DateTime<Utc>,
  pub channel_ids: Vec<String>,
}

/// Immutable catalog state produced by one refresh cycle.
#[derive(Debug)]
pub struct CatalogSnapshot {
  channels: Vec<Channel>,
  events: Vec<Event>,
  fetched_at: DateTime<Utc>,
  index: HashMap<String, usize>,
}

impl CatalogSnapshot {
  /// Build a snapshot, enforcing its invariants: channel ids are unique
  /// (first occurrence wins), events satisfy `start < end`, and event
  /// references to channels not in this snapshot are dropped.
  pub fn new(channels: Vec<Channel>, events: Vec<Event>, fetched_at: DateTime<Utc>) -> Self {
    let mut index = HashMap::with_capacity(channels.len());
    let mut unique = Vec::with_capacity(channels.len());
    for channel in channels {
      if index.contains_key(&channel.id) {
        debug!(id = %channel.id, "catalog: dropping duplicate channel id");
        continue;
      }
      index.insert(channel.id.clone(), unique.len());
      unique.push(channel);
    }

    let events = events
      .into_iter()
      .filter(|e| e.start < e.end)
      .map(|mut e| {
        let mut seen = HashSet::new();
        e.channel_ids.retain(|id| index.contains_key(id) && seen.insert(id.clone()));
        e
      })
      .collect();

    Self { channels: unique, events, fetched_at, index }
  }

  pub fn channels(&self) -> &[Channel] {
    &self.channels
  }

  pub fn events(&self) -> &[Event] {
    &self.events
  }

  pub fn fetched_at(&self) -> DateTime<Utc> {
    self.fetched_at
  }

  pub fn channel(&self, id: &str) -> Option<&Channel> {
    self.index.get(id).map(|&i| &self.channels[i])
  }

  /// Same channels with a new set of events.
  pub fn with_events(&self, events: Vec<Event>, fetched_at: DateTime<Utc>) -> Self {
    Self::new(self.channels.clone(), events, fetched_at)
  }

  /// New channels, keeping this snapshot's events (re-filtered against the new channels).
  pub fn with_channels(&self, channels: Vec<Channel>, fetched_at: DateTime<Utc>) -> Self {
    Self::new(channels, self.events.clone(), fetched_at)
  }
}

/// Holds the current snapshot. `commit` swaps the pointer; readers keep
/// whatever `Arc` they already hold, so nobody ever sees a half-built catalog.
pub struct CatalogStore {
  tx: watch::Sender<Option<Arc<CatalogSnapshot>>>,
  writer: Mutex<()>,
}

impl Default for CatalogStore {
  fn default() -> Self {
    Self::new()
  }
}

impl CatalogStore {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(None);
    Self { tx, writer: Mutex::new(()) }
  }

  /// Latest committed snapshot, or `None` before the first successful fetch.
  pub fn current(&self) -> Option<Arc<CatalogSnapshot>> {
    self.tx.borrow().clone()
  }

  pub fn commit(&self, snapshot: CatalogSnapshot) -> Arc<CatalogSnapshot> {
    self.update(|_| snapshot)
  }

  /// Build the next snapshot from the current one and commit it. Updates
  /// are serialised, so concurrent writers never drop each other's changes.
  pub fn update(&self, build: impl FnOnce(Option<&CatalogSnapshot>) -> CatalogSnapshot) -> Arc<CatalogSnapshot> {
    let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
    let current = self.current();
    let snapshot = Arc::new(build(current.as_deref()));
    info!(
      channels = snapshot.channels.len(),
      events = snapshot.events.len(),
      "catalog: committed snapshot"
    );
    self.tx.send_replace(Some(snapshot.clone()));
    snapshot
  }

  pub fn subscribe(&self) -> watch::Receiver<Option<Arc<CatalogSnapshot>>> {
    self.tx.subscribe()
  }
}

// --- Channel list normalisation ---

/// Suffix duplicate display names with ` (n)` in catalog order.
pub fn enumerate_duplicate_names(channels: &mut [Channel]) {
  let mut counts: HashMap<String, usize> = HashMap::new();
  for channel in channels.iter() {
    *counts.entry(channel.name.clone()).or_default() += 1;
  }
  let mut seen: HashMap<String, usize> = HashMap::new();
  for channel in channels.iter_mut() {
    if counts[&channel.name] > 1 {
      let n = seen.entry(channel.name.clone()).or_default();
      *n += 1;
      channel.name = format!("{} ({})", channel.name, n);
    }
  }
}

/// Adult (`18...`) channels last, everything else by name.
pub fn sort_channels(channels: &mut [Channel]) {
  channels.sort_by(|a, b| (a.name.starts_with("18"), &a.name).cmp(&(b.name.starts_with("18"), &b.name)));
}

/// Lowercase and strip every non-word character.
pub fn normalize_name(name: &str) -> String {
  name.chars().filter(|c| c.is_alphanumeric() || *c == '_').flat_map(char::to_lowercase).collect()
}

/// Drop a trailing ` (n)` enumeration suffix.
fn base_name(name: &str) -> &str {
  if let Some(open) = name.rfind(" (")
    && let Some(inner) = name[open + 2..].strip_suffix(')')
    && !inner.is_empty()
    && inner.chars().all(|c| c.is_ascii_digit())
  {
    return &name[..open];
  }
  name
}

/// Maps schedule channel references onto catalog ids.
pub struct ChannelResolver {
  by_id: HashMap<String, (String, String)>,
  by_name: HashMap<String, Vec<String>>,
}

impl ChannelResolver {
  pub fn new(channels: &[Channel]) -> Self {
    let mut by_id = HashMap::new();
    let mut by_name: HashMap<String, Vec<String>> = HashMap::new();
    for channel in channels {
      let full = normalize_name(&channel.name);
      let base = normalize_name(base_name(&channel.name));
      by_name.entry(full.clone()).or_default().push(channel.id.clone());
      if base != full {
        by_name.entry(base.clone()).or_default().push(channel.id.clone());
      }
      by_id.insert(channel.id.clone(), (full, base));
    }
    Self { by_id, by_name }
  }

  /// The ref's own id when the names agree, otherwise every channel whose
  /// name matches. Unknown refs resolve to nothing.
  pub fn resolve(&self, r: &ChannelRef) -> Vec<String> {
    let wanted = normalize_name(&r.name);
    if let Some((full, base)) = self.by_id.get(&r.id)
      && (wanted.is_empty() || *full == wanted || *base == wanted)
    {
      return vec![r.id.clone()];
    }
    self.by_name.get(&wanted).cloned().unwrap_or_default()
  }

  /// Resolve raw events, numbering them in schedule order.
  pub fn resolve_events(&self, raw: Vec<RawEvent>) -> Vec<Event> {
    raw
      .into_iter()
      .enumerate()
      .map(|(n, e)| {
        let mut channel_ids: Vec<String> = Vec::new();
        for r in &e.refs {
          for id in self.resolve(r) {
            if !channel_ids.contains(&id) {
              channel_ids.push(id);
            }
          }
        }
        Event {
          id: format!("{}-{n}", e.start.format("%Y%m%d%H%M")),
          title: e.title,
          category: e.category,
          start: e.start,
          end: e.end,
          channel_ids,
        }
      })
      .collect()
  }
}
