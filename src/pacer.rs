// src/pacer.rs
//! Minimum spacing between consecutive calls that share one pacer.
//!
//! Used for per-provider rate limits (start to start) and for the fixed pause
//! between classification batches (end to start, via [`Pacer::mark`]). Built on
//! `tokio::time::Instant` so paused-clock tests observe the delays without
//! sleeping for real.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
pub struct Pacer {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Waits until at least `min_interval` has passed since the previous turn.
    /// The first turn never waits.
    pub async fn wait_turn(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if ready_at > Instant::now() {
                sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Restart the interval from now. The next turn waits `min_interval` from
    /// this point, however long the work since `wait_turn` took.
    pub async fn mark(&self) {
        *self.last.lock().await = Some(Instant::now());
    }
}
