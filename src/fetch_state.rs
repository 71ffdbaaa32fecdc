// src/fetch_state.rs
//! # Fetch State Tracker
//! Decides which time window to request next for a `(scope, provider)` pair and
//! records the window once the fetch has been durably stored.
//!
//! `window_end` follows the provider's own clock: it is the newest
//! `published_at` actually observed for the pair, never wall-clock time. The next
//! request starts `buffer` before it, so a provider that publishes late (or whose
//! clock lags ours) is re-read instead of skipped; the raw-store dedup absorbs the
//! overlap.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::model::{FetchStateFilter, FetchStateRecord, Scope};
use crate::store::{FetchStateStore, NewsStore, RawStore, StoreResult};

/// Half-open request interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// `true` when no record existed (bounded look-back window).
    pub first_run: bool,
}

#[derive(Clone)]
pub struct FetchStateTracker {
    store: Arc<dyn NewsStore>,
    buffer: ChronoDuration,
    default_lookback: ChronoDuration,
}

impl FetchStateTracker {
    pub fn new(
        store: Arc<dyn NewsStore>,
        buffer: ChronoDuration,
        default_lookback: ChronoDuration,
    ) -> Self {
        Self {
            store,
            buffer: buffer.max(ChronoDuration::zero()),
            default_lookback,
        }
    }

    /// Next request window for the pair.
    ///
    /// * no record: `[now - default_lookback, now)`
    /// * otherwise: `[window_end - buffer, now)`
    ///
    /// `from` never exceeds `to`, even when a provider reported timestamps from our future.
    pub async fn next_window(
        &self,
        scope: &Scope,
        provider: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<FetchWindow> {
        let window = match self.store.fetch_state(scope, provider).await? {
            None => FetchWindow {
                from: now - self.default_lookback,
                to: now,
                first_run: true,
            },
            Some(rec) => FetchWindow {
                from: (rec.window_end - self.buffer).min(now),
                to: now,
                first_run: false,
            },
        };
        debug!(
            target: "fetch_state",
            scope = %scope, provider, from = %window.from, to = %window.to,
            first_run = window.first_run, "next window"
        );
        Ok(window)
    }

    /// Newest provider-reported timestamp already stored for the pair.
    pub async fn latest_observed(
        &self,
        scope: &Scope,
        provider: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        self.store.latest_published_at(scope, provider).await
    }

    /// Persist a window after its fetch+store step completed.
    ///
    /// `observed_end` is the newest usable timestamp seen for this fetch (or in the
    /// store). Without one, nothing is written and `None` is returned. The stored
    /// `window_end` never moves backwards.
    pub async fn commit(
        &self,
        scope: &Scope,
        provider: &str,
        window: &FetchWindow,
        observed_end: Option<DateTime<Utc>>,
        fetched: u64,
        stored: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<FetchStateRecord>> {
        let previous = self.store.fetch_state(scope, provider).await?;
        let prev_end = previous.as_ref().map(|r| r.window_end);

        let end = match (observed_end, prev_end) {
            (Some(o), Some(p)) => o.max(p),
            (Some(o), None) => o,
            (None, _) => {
                debug!(target: "fetch_state", scope = %scope, provider, "no usable timestamp; state unchanged");
                return Ok(None);
            }
        };

        let record = FetchStateRecord {
            scope: scope.clone(),
            provider: provider.to_string(),
            window_start: window.from.min(end),
            window_end: end,
            articles_fetched: fetched,
            articles_stored: stored,
            last_run_at: now,
            status: "success".to_string(),
        };
        self.store.save_fetch_state(&record).await?;
        info!(
            target: "fetch_state",
            scope = %scope, provider, window_end = %record.window_end, fetched, stored,
            "fetch state committed"
        );
        Ok(Some(record))
    }

    /// Force a full re-fetch for everything matching `filter`. Manual recovery only.
    pub async fn reset(&self, filter: &FetchStateFilter) -> StoreResult<u64> {
        let n = self.store.clear_fetch_state(filter).await?;
        info!(
            target: "fetch_state",
            scope = ?filter.scope.as_ref().map(|s| s.to_string()),
            provider = ?filter.provider, removed = n, "fetch state reset"
        );
        Ok(n)
    }
}
