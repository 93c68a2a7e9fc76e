//! Clock & Scheduler collaborator (spec.md §2 item B).
//!
//! Workers sleep in short slices so `Stop()` is observed within one
//! interval, per spec.md §5. `CancellationToken` is the idiomatic `tokio`
//! primitive for that; `SystemClock` is the production implementation and
//! `TestClock` lets tests advance time deterministically without real
//! sleeps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps in 1-second slices up to `duration`, returning early (with
    /// `false`) if `token` is cancelled. Returns `true` if the full
    /// duration elapsed.
    async fn sleep_cancellable(&self, duration: Duration, token: &CancellationToken) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_cancellable(&self, duration: Duration, token: &CancellationToken) -> bool {
        let slice = Duration::from_secs(1);
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            let step = remaining.min(slice);
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = token.cancelled() => return false,
            }
            remaining = remaining.saturating_sub(step);
        }
        true
    }
}

/// Manually-advanced clock for deterministic worker tests.
pub struct TestClock {
    now_ms: AtomicI64,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self { now_ms: AtomicI64::new(start.timestamp_millis()) })
    }

    pub fn advance(&self, duration: Duration) {
        self.now_ms.fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_ms.load(Ordering::SeqCst)).unwrap_or_else(Utc::now)
    }

    async fn sleep_cancellable(&self, duration: Duration, token: &CancellationToken) -> bool {
        self.advance(duration);
        !token.is_cancelled()
    }
}
