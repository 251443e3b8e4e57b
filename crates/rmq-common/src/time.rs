//! Time sources
//!
//! Scores, heartbeats and lock expiry are all epoch milliseconds. Components
//! read them through [`Clock`] so tests can run on tokio's paused clock and
//! still see scores move forward.

use std::fmt::Debug;
use std::time::Duration;

pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since the UNIX epoch.
    fn now_millis(&self) -> i64;

    /// Time left until `at_millis`, zero if it already passed.
    fn until(&self, at_millis: i64) -> Duration {
        let delta = at_millis - self.now_millis();
        Duration::from_millis(delta.max(0) as u64)
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Epoch time derived from tokio's clock.
///
/// Anchored to the wall clock once at construction and advanced by
/// `tokio::time::Instant`, so `tokio::time::pause()` and `advance()` move it.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    epoch_at_start: i64,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(chrono::Utc::now().timestamp_millis())
    }

    pub fn starting_at(epoch_millis: i64) -> Self {
        Self {
            epoch_at_start: epoch_millis,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        self.epoch_at_start + self.started.elapsed().as_millis() as i64
    }
}
