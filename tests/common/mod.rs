// tests/common/mod.rs
//
// Shared doubles for integration tests: a scripted classifier, a stub news
// provider, and a store wrapper that can be told to fail.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use market_news_pipeline::classify::{Classifier, ClassifyError, ClassifyInput, RawLabel};
use market_news_pipeline::config::PipelineConfig;
use market_news_pipeline::ingest::types::{clip_to_window, NewsProvider, ProviderError};
use market_news_pipeline::model::{
    ArticleUpsert, CanonicalArticle, Categorization, FetchStateFilter,
    FetchStateRecord, InsertOutcome, NewRawItem, RawArticle, RawItem, RawStats, Scope,
};
use market_news_pipeline::store::{
    ArticleStore, FetchStateStore, MemoryStore, RawStore, StoreError, StoreResult,
};
use market_news_pipeline::taxonomy::Category;

pub fn t(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 6, h, m, 0).unwrap()
}

pub fn article(url: &str, title: &str, published_at: DateTime<Utc>) -> RawArticle {
    RawArticle {
        url: url.to_string(),
        title: title.to_string(),
        summary: format!("{title} summary"),
        published_at,
        payload: serde_json::json!({ "url": url }),
    }
}

/// Defaults with every sleep switched off.
pub fn fast_config() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.categorize.delay_between_batches_ms = 0;
    cfg.categorize.backoff_base_secs = 0;
    cfg.fetch.provider_min_interval_ms = 0;
    cfg.scopes.symbols = vec!["AAPL".into()];
    cfg.scopes.include_all = false;
    cfg
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

pub enum Step {
    /// Same label for every item in the batch.
    LabelAll(&'static str),
    Labels(Vec<RawLabel>),
    Fail(ClassifyError),
}

pub struct ScriptedClassifier {
    steps: Mutex<VecDeque<Step>>,
    fallback: Option<&'static str>,
    calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl ScriptedClassifier {
    /// Plays `steps` in order, then labels everything `fallback` (or fails if `None`).
    pub fn new(steps: Vec<Step>, fallback: Option<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            fallback,
            calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
        })
    }

    pub fn always(label: &'static str) -> Arc<Self> {
        Self::new(Vec::new(), Some(label))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, batch: &[ClassifyInput]) -> Result<Vec<RawLabel>, ClassifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(batch.len());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::LabelAll(l)) => Ok(batch.iter().map(|_| RawLabel::new(l, "")).collect()),
            Some(Step::Labels(v)) => Ok(v),
            Some(Step::Fail(e)) => Err(e),
            None => match self.fallback {
                Some(l) => Ok(batch.iter().map(|_| RawLabel::new(l, "")).collect()),
                None => Err(ClassifyError::Malformed("script exhausted".into())),
            },
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct StubProvider {
    name: &'static str,
    articles: Mutex<Vec<RawArticle>>,
    fail: AtomicBool,
    windows: Mutex<Vec<(Scope, DateTime<Utc>, DateTime<Utc>)>>,
}

impl StubProvider {
    pub fn new(name: &'static str, articles: Vec<RawArticle>) -> Arc<Self> {
        Arc::new(Self {
            name,
            articles: Mutex::new(articles),
            fail: AtomicBool::new(false),
            windows: Mutex::new(Vec::new()),
        })
    }

    pub fn publish(&self, a: RawArticle) {
        self.articles.lock().unwrap().push(a);
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn windows(&self) -> Vec<(Scope, DateTime<Utc>, DateTime<Utc>)> {
        self.windows.lock().unwrap().clone()
    }
}

#[async_trait]
impl NewsProvider for StubProvider {
    async fn fetch(
        &self,
        scope: &Scope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawArticle>, ProviderError> {
        self.windows.lock().unwrap().push((scope.clone(), from, to));
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 503,
                body: "maintenance".into(),
            });
        }
        let all = self.articles.lock().unwrap().clone();
        Ok(clip_to_window(all, from, to))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

// ---------------------------------------------------------------------------
// Store that can be told to fail canonical or raw writes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_upserts: AtomicBool,
    /// Raw inserts whose URL contains this text fail.
    pub fail_raw_matching: Mutex<Option<String>>,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl RawStore for FlakyStore {
    async fn insert_raw(&self, item: &NewRawItem) -> StoreResult<InsertOutcome> {
        let poisoned = self
            .fail_raw_matching
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|needle| item.url.contains(needle));
        if poisoned {
            return Err(StoreError::Unavailable("raw table locked".into()));
        }
        self.inner.insert_raw(item).await
    }
    async fn pending_raw(&self, limit: usize) -> StoreResult<Vec<RawItem>> {
        self.inner.pending_raw(limit).await
    }
    async fn claim_raw(&self, ids: &[i64], now: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        self.inner.claim_raw(ids, now).await
    }
    async fn mark_raw_done(&self, id: i64) -> StoreResult<()> {
        self.inner.mark_raw_done(id).await
    }
    async fn mark_raw_failed(&self, id: i64, error: &str) -> StoreResult<()> {
        self.inner.mark_raw_failed(id, error).await
    }
    async fn count_pending(&self) -> StoreResult<u64> {
        self.inner.count_pending().await
    }
    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.reclaim_stale(older_than).await
    }
    async fn raw_stats(&self) -> StoreResult<RawStats> {
        self.inner.raw_stats().await
    }
    async fn latest_published_at(
        &self,
        scope: &Scope,
        provider: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        self.inner.latest_published_at(scope, provider).await
    }
}

#[async_trait]
impl ArticleStore for FlakyStore {
    async fn upsert_article(&self, article: &ArticleUpsert) -> StoreResult<i64> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk full".into()));
        }
        self.inner.upsert_article(article).await
    }
    async fn uncategorized_articles(&self, limit: usize) -> StoreResult<Vec<CanonicalArticle>> {
        self.inner.uncategorized_articles(limit).await
    }
    async fn update_article(&self, id: i64, outcome: &Categorization) -> StoreResult<()> {
        self.inner.update_article(id, outcome).await
    }
    async fn article(&self, scope: &Scope, url: &str) -> StoreResult<Option<CanonicalArticle>> {
        self.inner.article(scope, url).await
    }
    async fn articles_by_category(
        &self,
        category: Category,
        limit: usize,
    ) -> StoreResult<Vec<CanonicalArticle>> {
        self.inner.articles_by_category(category, limit).await
    }
    async fn news_stack(
        &self,
        scope: &Scope,
        limit: usize,
        excluded: &[Category],
    ) -> StoreResult<Vec<CanonicalArticle>> {
        self.inner.news_stack(scope, limit, excluded).await
    }
    async fn count_articles(&self) -> StoreResult<u64> {
        self.inner.count_articles().await
    }
    async fn scrub_placeholder_labels(&self) -> StoreResult<u64> {
        self.inner.scrub_placeholder_labels().await
    }
}

#[async_trait]
impl FetchStateStore for FlakyStore {
    async fn fetch_state(
        &self,
        scope: &Scope,
        provider: &str,
    ) -> StoreResult<Option<FetchStateRecord>> {
        self.inner.fetch_state(scope, provider).await
    }
    async fn save_fetch_state(&self, record: &FetchStateRecord) -> StoreResult<()> {
        self.inner.save_fetch_state(record).await
    }
    async fn clear_fetch_state(&self, filter: &FetchStateFilter) -> StoreResult<u64> {
        self.inner.clear_fetch_state(filter).await
    }
}
