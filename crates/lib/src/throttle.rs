//! The stutter gate.
//!
//! Some tools must not start in bursts. The gate holds a single permit;
//! acquiring it starts a timer that hands the permit back after the stutter
//! timeout, measured from acquisition. Dropping the returned `StutterPermit`
//! also hands it back. Whichever comes first wins and the other is a no-op,
//! so successive launches are spaced by the timeout without being serialized
//! for the whole run of the tool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::trace;

use crate::engine::Cancellation;

#[derive(Debug, thiserror::Error)]
#[error("cancelled while waiting for the stutter gate")]
pub struct GateCancelled;

#[derive(Debug)]
pub struct StutterGate {
  semaphore: Arc<Semaphore>,
  timeout: Option<Duration>,
  timers: Mutex<JoinSet<()>>,
  releases: Arc<AtomicUsize>,
}

/// Returns the gate's permit exactly once.
#[derive(Debug)]
struct ReleaseGuard {
  released: AtomicBool,
  semaphore: Arc<Semaphore>,
  releases: Arc<AtomicUsize>,
}

impl ReleaseGuard {
  fn release(&self) -> bool {
    if self.released.swap(true, Ordering::AcqRel) {
      return false;
    }
    self.semaphore.add_permits(1);
    self.releases.fetch_add(1, Ordering::AcqRel);
    true
  }
}

/// Held while a throttled tool launches.
#[derive(Debug)]
pub struct StutterPermit {
  guard: Option<Arc<ReleaseGuard>>,
}

impl StutterPermit {
  /// Hand the permit back now. Returns false if the timer already did.
  pub fn release(mut self) -> bool {
    self.guard.take().is_some_and(|guard| guard.release())
  }
}

impl Drop for StutterPermit {
  fn drop(&mut self) {
    if let Some(guard) = self.guard.take() {
      guard.release();
    }
  }
}

impl StutterGate {
  /// Without a timeout the gate never blocks.
  pub fn new(timeout: Option<Duration>) -> Self {
    Self {
      semaphore: Arc::new(Semaphore::new(1)),
      timeout,
      timers: Mutex::new(JoinSet::new()),
      releases: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout
  }

  /// Wait for the permit. Cancellation abandons the wait without taking it.
  pub async fn acquire(&self, cancel: &Cancellation) -> Result<StutterPermit, GateCancelled> {
    let Some(timeout) = self.timeout else {
      return Ok(StutterPermit { guard: None });
    };

    tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(GateCancelled),
      permit = self.semaphore.acquire() => match permit {
        Ok(permit) => permit.forget(),
        Err(_) => return Err(GateCancelled),
      },
    }

    let guard = Arc::new(ReleaseGuard {
      released: AtomicBool::new(false),
      semaphore: self.semaphore.clone(),
      releases: self.releases.clone(),
    });
    let timer_guard = guard.clone();
    let mut timers = self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    while timers.try_join_next().is_some() {}
    timers.spawn(async move {
      tokio::time::sleep(timeout).await;
      if timer_guard.release() {
        trace!(timeout = ?timeout, "stutter timer released permit");
      }
    });
    Ok(StutterPermit { guard: Some(guard) })
  }

  /// How many times a permit has been handed back.
  pub fn release_count(&self) -> usize {
    self.releases.load(Ordering::Acquire)
  }
}
