//! Durable channel inclusion record.
//!
//! Policy is default-include: a channel is in the playlist unless the record
//! explicitly maps its id to `false`. All writes go through [`SelectionStore::update`],
//! which serialises on a mutex, persists with write-to-temp-then-rename and only
//! then publishes the new record to readers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use crate::catalog::{CatalogSnapshot, Channel};
use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionRecord {
  /// Channel id → included. Absent ids are included.
  pub channels: BTreeMap<String, bool>,
  pub modified: Option<DateTime<Utc>>,
}

impl SelectionRecord {
  pub fn is_included(&self, id: &str) -> bool {
    self.channels.get(id).copied().unwrap_or(true)
  }
}

pub struct SelectionStore {
  path: PathBuf,
  tx: watch::Sender<Arc<SelectionRecord>>,
  write_lock: Mutex<()>,
}

impl SelectionStore {
  /// Load the persisted record. A missing or corrupt file falls back to
  /// include-all and is logged; it never fails startup.
  pub async fn load(path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    let record = match read_record(&path).await {
      Ok(Some(record)) => {
        info!(path = %path.display(), entries = record.channels.len(), "selection: loaded record");
        record
      }
      Ok(None) => {
        info!(path = %path.display(), "selection: no record yet, including all channels");
        SelectionRecord::default()
      }
      Err(e) => {
        warn!(path = %path.display(), err = %e, "selection: unreadable record, including all channels");
        SelectionRecord::default()
      }
    };
    let (tx, _) = watch::channel(Arc::new(record));
    Self { path, tx, write_lock: Mutex::new(()) }
  }

  pub fn record(&self) -> Arc<SelectionRecord> {
    self.tx.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<Arc<SelectionRecord>> {
    self.tx.subscribe()
  }

  /// Snapshot channel ids that survive the selection.
  pub fn effective_set(&self, snapshot: &CatalogSnapshot) -> HashSet<String> {
    let record = self.record();
    effective_channels(snapshot, &record).into_iter().map(|c| c.id.clone()).collect()
  }

  /// Mark `ids` included or excluded, persist, then notify subscribers.
  ///
  /// On a persistence failure the in-memory record is left unchanged and
  /// the error is returned so the caller can retry.
  pub async fn update(&self, ids: &[String], included: bool) -> Result<Arc<SelectionRecord>> {
    let _guard = self.write_lock.lock().await;

    let mut next = (*self.record()).clone();
    for id in ids {
      if included {
        // Default-include: dropping the entry keeps the file small.
        next.channels.remove(id);
      } else {
        next.channels.insert(id.clone(), false);
      }
    }
    next.modified = Some(Utc::now());

    write_record(&self.path, &next).await?;
    let next = Arc::new(next);
    self.tx.send_replace(next.clone());
    info!(count = ids.len(), included, "selection: updated");
    Ok(next)
  }
}

/// Channels of `snapshot` included by `record`, in snapshot order.
pub fn effective_channels<'a>(snapshot: &'a CatalogSnapshot, record: &SelectionRecord) -> Vec<&'a Channel> {
  snapshot.channels().iter().filter(|c| record.is_included(&c.id)).collect()
}

async fn read_record(path: &Path) -> Result<Option<SelectionRecord>> {
  match tokio::fs::read(path).await {
    Ok(bytes) => serde_json::from_slice(&bytes)
      .map(Some)
      .map_err(|e| Error::Persistence(format!("corrupt selection record: {e}"))),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(e) => Err(Error::Persistence(format!("failed to read {}: {e}", path.display()))),
  }
}

/// Write to a sibling temp file, fsync, then rename over the target.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
  let io_err = |what: &str, e: std::io::Error| Error::Persistence(format!("{what} {}: {e}", path.display()));

  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    tokio::fs::create_dir_all(parent).await.map_err(|e| io_err("failed to create directory for", e))?;
  }
  let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
  tmp_name.push(".tmp");
  let tmp_path = path.with_file_name(tmp_name);

  let mut file = tokio::fs::File::create(&tmp_path).await.map_err(|e| io_err("failed to create temp file for", e))?;
  file.write_all(bytes).await.map_err(|e| io_err("failed to write", e))?;
  file.sync_all().await.map_err(|e| io_err("failed to sync", e))?;
  drop(file);

  tokio::fs::rename(&tmp_path, path).await.map_err(|e| io_err("failed to replace", e))
}

async fn write_record(path: &Path, record: &SelectionRecord) -> Result<()> {
  let bytes = serde_json::to_vec_pretty(record).map_err(|e| Error::Persistence(e.to_string()))?;
  write_atomic(path, &bytes).await
}
