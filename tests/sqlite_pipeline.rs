// tests/sqlite_pipeline.rs
//
// Same flows as the in-memory tests, against the sqlite backend:
// - dedup + canonical upsert through a full run
// - ERROR rows stay quarantined; UNCATEGORIZED rows are retried in place
// - fetch state and items survive reopening the database file

mod common;

use std::sync::Arc;

use common::{article, fast_config, t, ScriptedClassifier, Step, StubProvider};
use market_news_pipeline::classify::ClassifyError;
use market_news_pipeline::ingest::types::NewsProvider;
use market_news_pipeline::model::{FetchStateFilter, Scope};
use market_news_pipeline::store::{ArticleStore, FetchStateStore, RawStore};
use market_news_pipeline::{Category, NewsStore, Pipeline, SqliteStore};

async fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap())
}

#[tokio::test]
async fn full_run_dedups_and_categorizes() {
    let store = memory_store().await;
    let finnhub = StubProvider::new(
        "finnhub",
        vec![
            article("https://www.news.test/deal?utm_source=fh", "Deal", t(9, 0)),
            article("https://news.test/other", "Other", t(9, 10)),
        ],
    );
    let polygon = StubProvider::new("polygon", vec![article("http://news.test/deal", "Deal", t(9, 1))]);
    let classifier = ScriptedClassifier::always("MERGERS_ACQUISITIONS");
    let pipeline = Pipeline::new(
        &fast_config(),
        store.clone() as Arc<dyn NewsStore>,
        classifier,
        vec![finnhub as Arc<dyn NewsProvider>, polygon as Arc<dyn NewsProvider>],
    )
    .unwrap();

    let summary = pipeline.run_once(t(10, 0)).await.unwrap();
    assert_eq!(summary.stored, 2);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.categorized, 2);
    assert_eq!(store.count_articles().await.unwrap(), 2);

    let scope = Scope::symbol("AAPL");
    let row = store.article(&scope, "https://news.test/deal").await.unwrap().unwrap();
    assert_eq!(row.category, Category::MergersAcquisitions);

    let stats = store.raw_stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.done, 2);

    let f = store.fetch_state(&scope, "finnhub").await.unwrap().unwrap();
    assert_eq!(f.window_end, t(9, 10));
    assert_eq!(f.status, "success");
}

#[tokio::test]
async fn error_is_quarantined_and_uncategorized_is_retried() {
    let store = memory_store().await;
    let p = StubProvider::new(
        "finnhub",
        vec![
            article("https://news.test/a", "A", t(9, 0)),
            article("https://news.test/b", "B", t(9, 5)),
        ],
    );
    let mut cfg = fast_config();
    cfg.categorize.batch_size = 1;
    let classifier = ScriptedClassifier::new(
        vec![
            Step::Fail(ClassifyError::from_status(400, "content policy")),
            Step::Fail(ClassifyError::from_status(500, "oops")),
            Step::Fail(ClassifyError::from_status(500, "oops")),
            Step::Fail(ClassifyError::from_status(500, "oops")),
        ],
        Some("EARNINGS"),
    );
    let pipeline = Pipeline::new(
        &cfg,
        store.clone() as Arc<dyn NewsStore>,
        classifier.clone(),
        vec![p as Arc<dyn NewsProvider>],
    )
    .unwrap();

    let first = pipeline.run_once(t(10, 0)).await.unwrap();
    assert_eq!(first.errored, 1);
    assert_eq!(first.uncategorized, 1);
    assert_eq!(classifier.calls(), 4);

    let errored = store.articles_by_category(Category::Error, 10).await.unwrap();
    assert_eq!(errored.len(), 1);
    assert_eq!(errored[0].error_log.as_deref(), Some("HTTP 400: content policy"));

    // second run: recategorize picks up only the UNCATEGORIZED row
    let second = pipeline.run_once(t(10, 15)).await.unwrap();
    assert_eq!(second.recategorized, 1);
    assert_eq!(classifier.calls(), 5);
    assert_eq!(store.articles_by_category(Category::Error, 10).await.unwrap().len(), 1);
    assert_eq!(store.articles_by_category(Category::Earnings, 10).await.unwrap().len(), 1);
    assert!(store.uncategorized_articles(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("news.db").display());
    let scope = Scope::symbol("AAPL");

    {
        let store = Arc::new(SqliteStore::connect(&url).await.unwrap());
        let p = StubProvider::new("polygon", vec![article("https://news.test/x", "X", t(9, 30))]);
        let pipeline = Pipeline::new(
            &fast_config(),
            store.clone() as Arc<dyn NewsStore>,
            ScriptedClassifier::always("PRODUCT"),
            vec![p as Arc<dyn NewsProvider>],
        )
        .unwrap();
        pipeline.run_once(t(10, 0)).await.unwrap();
    }

    let store = SqliteStore::connect(&url).await.unwrap();
    assert_eq!(store.count_articles().await.unwrap(), 1);
    let rec = store.fetch_state(&scope, "polygon").await.unwrap().unwrap();
    assert_eq!(rec.window_end, t(9, 30));

    let removed = store
        .clear_fetch_state(&FetchStateFilter {
            scope: Some(scope.clone()),
            provider: None,
        })
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(store.fetch_state(&scope, "polygon").await.unwrap().is_none());
}
