use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::constants::constants;
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  /// Total attempts, including the first.
  pub attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    let c = constants();
    Self {
      attempts: c.retry_attempts.max(1),
      base_delay: Duration::from_millis(c.retry_base_delay_ms),
      max_delay: Duration::from_millis(c.retry_max_delay_ms),
    }
  }
}

impl RetryPolicy {
  /// Exponential backoff: base, 2×base, 4×base... capped at `max_delay`.
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    self.base_delay.saturating_mul(1u32 << attempt.min(16)).min(self.max_delay)
  }

  /// Run `op` until it succeeds, fails permanently, or the budget is spent.
  pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let mut attempt = 0;
    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(e) if e.is_transient() && attempt + 1 < self.attempts => {
          let delay = self.delay_for_attempt(attempt);
          warn!(what, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, err = %e, "upstream: transient failure, retrying");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(e) => return Err(e),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn fast(attempts: u32) -> RetryPolicy {
    RetryPolicy { attempts, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(4) }
  }

  #[test]
  fn backoff_grows_and_caps() {
    let p = RetryPolicy { attempts: 5, base_delay: Duration::from_millis(100), max_delay: Duration::from_millis(300) };
    assert_eq!(p.delay_for_attempt(0), Duration::from_millis(100));
    assert_eq!(p.delay_for_attempt(1), Duration::from_millis(200));
    assert_eq!(p.delay_for_attempt(2), Duration::from_millis(300));
    assert_eq!(p.delay_for_attempt(40), Duration::from_millis(300));
  }

  #[tokio::test]
  async fn transient_errors_retry_until_success() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let result = fast(3)
      .run("test", move || async move {
        if calls.fetch_add(1, Ordering::SeqCst) < 2 { Err(Error::transient("503")) } else { Ok(7) }
      })
      .await;
    assert_eq!(result.unwrap(), 7);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn permanent_errors_are_not_retried() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let result: Result<()> = fast(3)
      .run("test", move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::permanent("404"))
      })
      .await;
    assert!(matches!(result, Err(Error::UpstreamPermanent(_))));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn budget_is_bounded() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let result: Result<()> = fast(2)
      .run("test", move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::transient("timeout"))
      })
      .await;
    assert!(result.unwrap_err().is_transient());
    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }
}
