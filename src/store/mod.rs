// src/store/mod.rs
//! Persistence boundary. Every component reads and writes through these traits;
//! atomicity (insert-or-ignore, compare-and-set on processing state, upsert by
//! `(scope, url)`) is the backend's job, not the caller's.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    ArticleUpsert, BulkInsertStats, CanonicalArticle, Categorization, FetchStateFilter,
    FetchStateRecord, InsertOutcome, NewRawItem, RawItem, RawStats, Scope,
};
use crate::taxonomy::Category;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Infrastructure failure. Aborts the current pipeline invocation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Placeholder text some classifier runs wrote instead of an empty label.
pub const PLACEHOLDER_LABEL: &str = "empty string";

#[async_trait]
pub trait RawStore: Send + Sync {
    /// Insert-or-ignore on `(scope, fingerprint)`.
    async fn insert_raw(&self, item: &NewRawItem) -> StoreResult<InsertOutcome>;

    /// PENDING items, oldest first.
    async fn pending_raw(&self, limit: usize) -> StoreResult<Vec<RawItem>>;

    /// PENDING → PROCESSING for each id still PENDING. Returns the ids actually claimed.
    async fn claim_raw(&self, ids: &[i64], now: DateTime<Utc>) -> StoreResult<Vec<i64>>;

    async fn mark_raw_done(&self, id: i64) -> StoreResult<()>;

    async fn mark_raw_failed(&self, id: i64, error: &str) -> StoreResult<()>;

    async fn count_pending(&self) -> StoreResult<u64>;

    /// PROCESSING items claimed before `older_than` go back to PENDING.
    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    async fn raw_stats(&self) -> StoreResult<RawStats>;

    /// Max provider-reported `published_at` already fetched for the pair.
    async fn latest_published_at(
        &self,
        scope: &Scope,
        provider: &str,
    ) -> StoreResult<Option<DateTime<Utc>>>;

    /// Inserts one by one. The first store error is returned as is; rows written
    /// before it stay, and the caller must not commit the fetch window.
    async fn bulk_insert_raw(&self, items: &[NewRawItem]) -> StoreResult<BulkInsertStats> {
        let mut stats = BulkInsertStats {
            total: items.len(),
            ..Default::default()
        };
        for item in items {
            match self.insert_raw(item).await {
                Ok(InsertOutcome::Inserted) => stats.inserted += 1,
                Ok(InsertOutcome::Duplicate) => stats.duplicates += 1,
                Err(e) => {
                    tracing::warn!(
                        target: "store",
                        error = %e,
                        written = stats.inserted + stats.duplicates,
                        total = stats.total,
                        "raw insert failed; aborting bulk insert"
                    );
                    return Err(e);
                }
            }
        }
        Ok(stats)
    }
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Insert-or-update keyed by `(scope, url)`. An existing ERROR row is never
    /// downgraded to UNCATEGORIZED. Returns the row id.
    async fn upsert_article(&self, article: &ArticleUpsert) -> StoreResult<i64>;

    /// UNCATEGORIZED rows only, oldest `updated_at` first. ERROR rows never appear.
    async fn uncategorized_articles(&self, limit: usize) -> StoreResult<Vec<CanonicalArticle>>;

    /// In-place update after (re-)categorization. Same ERROR→UNCATEGORIZED guard.
    async fn update_article(&self, id: i64, outcome: &Categorization) -> StoreResult<()>;

    async fn article(&self, scope: &Scope, url: &str) -> StoreResult<Option<CanonicalArticle>>;

    async fn articles_by_category(
        &self,
        category: Category,
        limit: usize,
    ) -> StoreResult<Vec<CanonicalArticle>>;

    /// Newest first, skipping `excluded` categories.
    async fn news_stack(
        &self,
        scope: &Scope,
        limit: usize,
        excluded: &[Category],
    ) -> StoreResult<Vec<CanonicalArticle>>;

    async fn count_articles(&self) -> StoreResult<u64>;

    /// Rewrites secondary labels equal to [`PLACEHOLDER_LABEL`] to "". Returns rows touched.
    async fn scrub_placeholder_labels(&self) -> StoreResult<u64>;
}

#[async_trait]
pub trait FetchStateStore: Send + Sync {
    async fn fetch_state(&self, scope: &Scope, provider: &str)
        -> StoreResult<Option<FetchStateRecord>>;

    async fn save_fetch_state(&self, record: &FetchStateRecord) -> StoreResult<()>;

    /// Returns the number of records removed.
    async fn clear_fetch_state(&self, filter: &FetchStateFilter) -> StoreResult<u64>;
}

/// Everything the pipeline needs from persistence.
pub trait NewsStore: RawStore + ArticleStore + FetchStateStore {}

impl<T: RawStore + ArticleStore + FetchStateStore> NewsStore for T {}

/// ERROR is sticky against automatic downgrades.
pub(crate) fn accepts_transition(existing: Option<Category>, incoming: Category) -> bool {
    !(existing == Some(Category::Error) && incoming == Category::Uncategorized)
}
