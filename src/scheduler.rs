//! Background refresh: a frequent catalog cycle and a daily guide cycle.
//!
//! Each loop logs its own failures and carries on; nothing here can take the
//! process down or replace a good artifact with a failed one.

use chrono::{DateTime, Days, Duration as ChronoDuration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogSnapshot, CatalogStore};
use crate::error::{Error, Result};
use crate::guide::{GuidePublisher, GuideRenderer};
use crate::selection::SelectionStore;
use crate::upstream::Upstream;

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A wall-clock time of day in a fixed timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
  at: NaiveTime,
  tz: Tz,
}

impl DailySchedule {
  pub fn new(at: NaiveTime, tz: Tz) -> Self {
    Self { at, tz }
  }

  /// The instant the schedule fires on local `date`. A time skipped by a DST
  /// jump fires an hour later; a repeated time fires on its first pass.
  fn on(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
    let local = date.and_time(self.at);
    match self.tz.from_local_datetime(&local) {
      LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
      LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
      LocalResult::None => {
        self.tz.from_local_datetime(&(local + ChronoDuration::hours(1))).earliest().map(|t| t.with_timezone(&Utc))
      }
    }
  }

  /// First firing strictly after `now`.
  pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.with_timezone(&self.tz).date_naive();
    (0..=2u64)
      .filter_map(|d| today.checked_add_days(Days::new(d)))
      .filter_map(|date| self.on(date))
      .find(|t| *t > now)
      .unwrap_or(now + ChronoDuration::days(1))
  }

  /// Latest firing at or before `now`.
  pub fn previous(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = now.with_timezone(&self.tz).date_naive();
    (0..=2u64)
      .filter_map(|d| today.checked_sub_days(Days::new(d)))
      .filter_map(|date| self.on(date))
      .find(|t| *t <= now)
  }

  /// Whether a firing has passed since `last_run`. Covers the case of the
  /// process being down at the scheduled time.
  pub fn is_due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match (last_run, self.previous(now)) {
      (None, _) => true,
      (Some(last), Some(fired)) => fired > last,
      (Some(_), None) => false,
    }
  }
}

fn until(when: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
  (when - now).to_std().unwrap_or_default()
}

pub struct Scheduler {
  upstream: Arc<dyn Upstream>,
  catalog: Arc<CatalogStore>,
  selection: Arc<SelectionStore>,
  guide: Arc<GuidePublisher>,
  renderer: GuideRenderer,
  schedule: DailySchedule,
  clock: Arc<dyn Clock>,
  catalog_interval: Duration,
  events_loaded: AtomicBool,
  /// Last successful event fetch. Selection re-renders do not move it.
  guide_refreshed: Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
  pub fn new(
    upstream: Arc<dyn Upstream>,
    catalog: Arc<CatalogStore>,
    selection: Arc<SelectionStore>,
    guide: Arc<GuidePublisher>,
    renderer: GuideRenderer,
    schedule: DailySchedule,
    catalog_interval: Duration,
  ) -> Self {
    // A cached guide on disk counts as the last refresh.
    let guide_refreshed = Mutex::new(guide.published_at());
    Self {
      upstream,
      catalog,
      selection,
      guide,
      renderer,
      schedule,
      clock: Arc::new(SystemClock),
      catalog_interval,
      events_loaded: AtomicBool::new(false),
      guide_refreshed,
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Fetch the channel list and commit it, keeping the current events.
  pub async fn refresh_catalog(&self) -> Result<Arc<CatalogSnapshot>> {
    let fresh = self.upstream.fetch_catalog().await?;
    let now = self.clock.now();
    Ok(self.catalog.update(|current| match current {
      Some(current) => current.with_channels(fresh.channels().to_vec(), now),
      None => fresh,
    }))
  }

  /// Fetch events for the current channels, commit, then render and publish.
  /// On any failure the published guide is left untouched.
  pub async fn refresh_guide(&self) -> Result<()> {
    let current = self.catalog.current().ok_or_else(|| Error::not_found("catalog not loaded yet"))?;
    let events = self.upstream.fetch_events(current.channels()).await?;
    let now = self.clock.now();
    // Channels may have moved on while events were in flight.
    let snapshot = self.catalog.update(|latest| latest.unwrap_or(&*current).with_events(events, now));
    self.events_loaded.store(true, Ordering::SeqCst);
    *self.guide_refreshed.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
    self.publish(&snapshot).await;
    Ok(())
  }

  /// Re-render from the current snapshot without touching upstream.
  pub async fn render_guide(&self) {
    if !self.events_loaded.load(Ordering::SeqCst) {
      debug!("scheduler: no events loaded yet, guide left as is");
      return;
    }
    if let Some(snapshot) = self.catalog.current() {
      self.publish(&snapshot).await;
    }
  }

  async fn publish(&self, snapshot: &CatalogSnapshot) {
    let record = self.selection.record();
    let document = self.renderer.render(snapshot, &record);
    self.guide.publish(document, self.clock.now()).await;
  }

  pub fn guide_due(&self) -> bool {
    let last = *self.guide_refreshed.lock().unwrap_or_else(PoisonError::into_inner);
    self.schedule.is_due(last, self.clock.now())
  }

  /// Run every loop until `cancel` fires.
  pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
    let tasks = [
      tokio::spawn(self.clone().catalog_loop(cancel.clone())),
      tokio::spawn(self.clone().guide_loop(cancel.clone())),
      tokio::spawn(self.clone().selection_loop(cancel.clone())),
    ];
    for task in tasks {
      if let Err(e) = task.await {
        warn!(err = %e, "scheduler: loop terminated abnormally");
      }
    }
    info!("scheduler: stopped");
  }

  async fn catalog_loop(self: Arc<Self>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(self.catalog_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        () = cancel.cancelled() => break,
        _ = ticker.tick() => {}
      }
      let result = tokio::select! {
        () = cancel.cancelled() => break,
        result = self.refresh_catalog() => result,
      };
      match result {
        Ok(snapshot) => debug!(channels = snapshot.channels().len(), "scheduler: catalog refreshed"),
        Err(e) => warn!(err = %e, "scheduler: catalog refresh failed, keeping previous snapshot"),
      }
    }
  }

  /// Runs the guide job on the first catalog after startup, then daily.
  async fn guide_loop(self: Arc<Self>, cancel: CancellationToken) {
    let mut catalog_rx = self.catalog.subscribe();
    let mut initial = true;
    loop {
      let now = self.clock.now();
      let mut wait = until(self.schedule.next_after(now), now);

      if self.catalog.current().is_some() && (initial || self.guide_due()) {
        let result = tokio::select! {
          () = cancel.cancelled() => break,
          result = self.refresh_guide() => result,
        };
        match result {
          Ok(()) => {
            initial = false;
            info!(next = %self.schedule.next_after(self.clock.now()), "scheduler: guide refreshed");
          }
          Err(e) => {
            warn!(err = %e, "scheduler: guide refresh failed, keeping previous guide");
            wait = wait.min(self.catalog_interval);
          }
        }
      }

      tokio::select! {
        () = cancel.cancelled() => break,
        () = tokio::time::sleep(wait) => {}
        changed = catalog_rx.changed() => if changed.is_err() { break },
      }
    }
  }

  async fn selection_loop(self: Arc<Self>, cancel: CancellationToken) {
    let mut rx = self.selection.subscribe();
    loop {
      tokio::select! {
        () = cancel.cancelled() => break,
        changed = rx.changed() => if changed.is_err() { break },
      }
      rx.borrow_and_update();
      self.render_guide().await;
    }
  }
}
