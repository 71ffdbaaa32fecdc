// tests/categorize_retry.rs
//
// Categorization engine failure handling, on a paused clock:
// - throttling backs off linearly and then succeeds
// - exhausted transient retries land UNCATEGORIZED, permanent errors land ERROR
// - ERROR rows are never picked up again by recategorization
// - batches are spaced by the fixed inter-batch delay, counted from the end
//   of the previous batch
// - the admission gate caps concurrent classifier calls

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{article, t, ScriptedClassifier, Step};
use market_news_pipeline::categorize::CategorizationEngine;
use market_news_pipeline::classify::{
    Classifier, ClassifyError, ClassifyInput, DynClassifier, RawLabel,
};
use market_news_pipeline::config::CategorizeConfig;
use market_news_pipeline::model::{
    ArticleUpsert, Categorization, NewRawItem, ProcessingState, RawArticle, Scope,
};
use market_news_pipeline::store::{ArticleStore, MemoryStore, NewsStore, RawStore};
use market_news_pipeline::Category;
use tokio::time::Instant;

async fn seed(store: &MemoryStore, urls: &[&str]) {
    let scope = Scope::symbol("AAPL");
    for (i, u) in urls.iter().enumerate() {
        let a = article(u, &format!("Headline {i}"), t(9, i as u32));
        store
            .insert_raw(&NewRawItem::from_article(&scope, "finnhub", a))
            .await
            .unwrap();
    }
}

fn engine(store: &Arc<MemoryStore>, classifier: DynClassifier, cfg: CategorizeConfig) -> CategorizationEngine {
    CategorizationEngine::new(store.clone() as Arc<dyn NewsStore>, classifier, cfg)
}

fn now() -> DateTime<Utc> {
    t(10, 0)
}

#[tokio::test(start_paused = true)]
async fn throttled_call_backs_off_then_succeeds() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &["https://x.test/1", "https://x.test/2"]).await;
    let classifier = ScriptedClassifier::new(
        vec![Step::Fail(ClassifyError::from_status(429, "slow down"))],
        Some("EARNINGS"),
    );
    let eng = engine(&store, classifier.clone(), CategorizeConfig::default());

    let t0 = Instant::now();
    let stats = eng.drain_pending(now()).await.unwrap();
    assert!(Instant::now() - t0 >= Duration::from_secs(5));

    assert_eq!(stats.categorized, 2);
    assert_eq!(classifier.calls(), 2);
    let raw = store.raw_snapshot().unwrap();
    assert!(raw.iter().all(|r| r.state == ProcessingState::Done));
    let rows = store.article_snapshot().unwrap();
    assert!(rows.iter().all(|a| a.category == Category::Earnings && a.error_log.is_none()));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_land_uncategorized() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &["https://x.test/1"]).await;
    let classifier = ScriptedClassifier::new(
        vec![
            Step::Fail(ClassifyError::from_status(503, "down")),
            Step::Fail(ClassifyError::from_status(503, "down")),
            Step::Fail(ClassifyError::from_status(503, "down")),
        ],
        None,
    );
    let eng = engine(&store, classifier.clone(), CategorizeConfig::default());

    let t0 = Instant::now();
    let stats = eng.drain_pending(now()).await.unwrap();
    // 5s + 10s of backoff before the final attempt
    assert!(Instant::now() - t0 >= Duration::from_secs(15));
    assert_eq!(classifier.calls(), 3);
    assert_eq!(stats.uncategorized, 1);

    let row = &store.article_snapshot().unwrap()[0];
    assert_eq!(row.category, Category::Uncategorized);
    let log = row.error_log.as_deref().unwrap();
    assert!(log.contains("HTTP 503: down"), "{log}");

    let raw = &store.raw_snapshot().unwrap()[0];
    assert_eq!(raw.state, ProcessingState::Failed);
    assert!(raw.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn permanent_rejection_is_quarantined_as_error() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &["https://x.test/1", "https://x.test/2"]).await;
    let classifier = ScriptedClassifier::new(
        vec![Step::Fail(ClassifyError::from_status(400, "bad request"))],
        Some("EARNINGS"),
    );
    let eng = engine(&store, classifier.clone(), CategorizeConfig::default());

    let stats = eng.drain_pending(now()).await.unwrap();
    assert_eq!(stats.errored, 2);
    assert_eq!(classifier.calls(), 1, "permanent errors are not retried");

    for row in store.article_snapshot().unwrap() {
        assert_eq!(row.category, Category::Error);
        assert_eq!(row.error_log.as_deref(), Some("HTTP 400: bad request"));
    }

    // quarantined rows are invisible to recategorization
    let again = eng.recategorize(20).await.unwrap();
    assert_eq!(again.processed, 0);
    assert_eq!(classifier.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn label_count_mismatch_rejects_whole_batch() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &["https://x.test/1", "https://x.test/2"]).await;
    let classifier = ScriptedClassifier::new(
        vec![Step::Labels(vec![RawLabel::new("EARNINGS", "")])],
        None,
    );
    let eng = engine(&store, classifier, CategorizeConfig::default());

    let stats = eng.drain_pending(now()).await.unwrap();
    assert_eq!(stats.errored, 2);
    for row in store.article_snapshot().unwrap() {
        assert_eq!(row.category, Category::Error);
        assert!(row
            .error_log
            .as_deref()
            .unwrap()
            .contains("expected 2 labels, got 1"));
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_label_errors_only_that_item() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &["https://x.test/1", "https://x.test/2"]).await;
    let classifier = ScriptedClassifier::new(
        vec![Step::Labels(vec![
            RawLabel::new("EARNINGS", "Q3 beat"),
            RawLabel::new("WEATHER", ""),
        ])],
        None,
    );
    let eng = engine(&store, classifier, CategorizeConfig::default());
    eng.drain_pending(now()).await.unwrap();

    let rows = store.article_snapshot().unwrap();
    assert_eq!(rows[0].category, Category::Earnings);
    assert_eq!(rows[0].secondary_label, "Q3 beat");
    assert_eq!(rows[1].category, Category::Error);
    assert!(rows[1]
        .error_log
        .as_deref()
        .unwrap()
        .starts_with("unparseable response"));
}

#[tokio::test(start_paused = true)]
async fn empty_item_is_rejected_without_a_call() {
    let store = Arc::new(MemoryStore::new());
    let blank = RawArticle {
        url: "https://x.test/blank".into(),
        title: "  ".into(),
        summary: String::new(),
        published_at: t(9, 0),
        payload: serde_json::Value::Null,
    };
    store
        .insert_raw(&NewRawItem::from_article(&Scope::All, "polygon", blank))
        .await
        .unwrap();
    let classifier = ScriptedClassifier::always("EARNINGS");
    let eng = engine(&store, classifier.clone(), CategorizeConfig::default());

    let stats = eng.drain_pending(now()).await.unwrap();
    assert_eq!(stats.errored, 1);
    assert_eq!(classifier.calls(), 0);
    assert_eq!(store.raw_snapshot().unwrap()[0].state, ProcessingState::Failed);
}

#[tokio::test(start_paused = true)]
async fn batches_are_spaced_by_fixed_delay() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &["https://x.test/1", "https://x.test/2", "https://x.test/3"]).await;
    let classifier = ScriptedClassifier::always("PRODUCT");
    let cfg = CategorizeConfig {
        batch_size: 1,
        ..Default::default()
    };
    let eng = engine(&store, classifier.clone(), cfg);

    let t0 = Instant::now();
    let stats = eng.drain_pending(now()).await.unwrap();
    assert_eq!(stats.batches, 3);
    assert_eq!(classifier.batch_sizes(), vec![1, 1, 1]);
    assert!(Instant::now() - t0 >= Duration::from_secs(4));
}

/// Takes `work` per call and records when each call started and returned.
struct TimedClassifier {
    work: Duration,
    throttle_first: AtomicBool,
    calls: Mutex<Vec<(Instant, Instant)>>,
}

impl TimedClassifier {
    fn new(work: Duration, throttle_first: bool) -> Arc<Self> {
        Arc::new(Self {
            work,
            throttle_first: AtomicBool::new(throttle_first),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(Instant, Instant)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Classifier for TimedClassifier {
    async fn classify(&self, batch: &[ClassifyInput]) -> Result<Vec<RawLabel>, ClassifyError> {
        let start = Instant::now();
        tokio::time::sleep(self.work).await;
        self.calls.lock().unwrap().push((start, Instant::now()));
        if self.throttle_first.swap(false, Ordering::SeqCst) {
            return Err(ClassifyError::from_status(429, "slow down"));
        }
        Ok(batch.iter().map(|_| RawLabel::new("PRODUCT", "")).collect())
    }

    fn name(&self) -> &'static str {
        "timed"
    }
}

#[tokio::test(start_paused = true)]
async fn slow_batch_is_still_followed_by_the_full_delay() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &["https://x.test/1", "https://x.test/2"]).await;
    let classifier = TimedClassifier::new(Duration::from_secs(3), false);
    let cfg = CategorizeConfig {
        batch_size: 1,
        ..Default::default()
    };
    let eng = engine(&store, classifier.clone(), cfg);

    let stats = eng.drain_pending(now()).await.unwrap();
    assert_eq!(stats.categorized, 2);
    let calls = classifier.calls();
    assert_eq!(calls.len(), 2);
    let gap = calls[1].0 - calls[0].1;
    assert!(gap >= Duration::from_secs(2), "gap after slow batch was {gap:?}");
}

#[tokio::test(start_paused = true)]
async fn delay_after_backoff_is_not_absorbed_by_it() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &["https://x.test/1", "https://x.test/2"]).await;
    let classifier = TimedClassifier::new(Duration::ZERO, true);
    let cfg = CategorizeConfig {
        batch_size: 1,
        ..Default::default()
    };
    let eng = engine(&store, classifier.clone(), cfg);

    let stats = eng.drain_pending(now()).await.unwrap();
    assert_eq!(stats.categorized, 2);
    // throttled, retried after backoff, then the second batch
    let calls = classifier.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[1].0 - calls[0].1 >= Duration::from_secs(5));
    let gap = calls[2].0 - calls[1].1;
    assert!(gap >= Duration::from_secs(2), "gap after retried batch was {gap:?}");
}

#[tokio::test(start_paused = true)]
async fn recategorize_fills_in_deferred_rows() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &["https://x.test/1"]).await;
    let classifier = ScriptedClassifier::new(
        vec![
            Step::Fail(ClassifyError::Transport("connection reset".into())),
            Step::Fail(ClassifyError::Transport("connection reset".into())),
            Step::Fail(ClassifyError::Transport("connection reset".into())),
        ],
        Some("ANALYST_RATING"),
    );
    let eng = engine(&store, classifier, CategorizeConfig::default());
    eng.drain_pending(now()).await.unwrap();
    assert_eq!(
        store.article_snapshot().unwrap()[0].category,
        Category::Uncategorized
    );

    let stats = eng.recategorize(20).await.unwrap();
    assert_eq!(stats.categorized, 1);
    let row = &store.article_snapshot().unwrap()[0];
    assert_eq!(row.category, Category::AnalystRating);
    assert!(row.error_log.is_none());
    assert_eq!(store.count_articles().await.unwrap(), 1, "updated in place");
}

#[tokio::test]
async fn error_row_is_not_downgraded_by_later_transient_failure() {
    let store = MemoryStore::new();
    let scope = Scope::symbol("TSLA");
    let raw = NewRawItem::from_article(&scope, "finnhub", article("https://x.test/e", "E", t(9, 0)));
    store.insert_raw(&raw).await.unwrap();
    let item = store.pending_raw(1).await.unwrap().remove(0);

    store
        .upsert_article(&ArticleUpsert::from_raw(
            &item,
            Categorization::Rejected {
                detail: "HTTP 400: nope".into(),
            },
        ))
        .await
        .unwrap();
    store
        .upsert_article(&ArticleUpsert::from_raw(
            &item,
            Categorization::Deferred {
                detail: "HTTP 503: later".into(),
            },
        ))
        .await
        .unwrap();

    let row = store.article(&scope, &item.url).await.unwrap().unwrap();
    assert_eq!(row.category, Category::Error);
    assert_eq!(row.error_log.as_deref(), Some("HTTP 400: nope"));
}

/// Sleeps inside every call and records the highest number of overlapping calls.
struct InFlightCounter {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Classifier for InFlightCounter {
    async fn classify(&self, batch: &[ClassifyInput]) -> Result<Vec<RawLabel>, ClassifyError> {
        let n = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(n, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(batch.iter().map(|_| RawLabel::new("MANAGEMENT", "")).collect())
    }

    fn name(&self) -> &'static str {
        "in-flight"
    }
}

#[tokio::test(start_paused = true)]
async fn shared_gate_serializes_classifier_calls() {
    let store = Arc::new(MemoryStore::new());
    let urls: Vec<String> = (0..6).map(|i| format!("https://x.test/{i}")).collect();
    let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
    seed(&store, &refs).await;

    let counter = Arc::new(InFlightCounter {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let cfg = CategorizeConfig {
        batch_size: 1,
        delay_between_batches_ms: 0,
        concurrency_limit: 1,
        ..Default::default()
    };
    let gate = Arc::new(tokio::sync::Semaphore::new(cfg.concurrency_limit));
    let a = CategorizationEngine::with_gate(
        store.clone() as Arc<dyn NewsStore>,
        counter.clone(),
        cfg.clone(),
        gate.clone(),
    );
    let b = CategorizationEngine::with_gate(store.clone() as Arc<dyn NewsStore>, counter.clone(), cfg, gate);

    let (ra, rb) = tokio::join!(a.drain_pending(now()), b.drain_pending(now()));
    let total = ra.unwrap().processed + rb.unwrap().processed;

    assert_eq!(total, 6, "each raw item is claimed exactly once");
    assert_eq!(counter.peak.load(Ordering::SeqCst), 1);
}
