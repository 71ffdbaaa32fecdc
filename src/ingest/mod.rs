// src/ingest/mod.rs
pub mod providers;
pub mod types;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use metrics::{counter, describe_counter, describe_histogram};
use once_cell::sync::OnceCell;
use std::sync::Arc;

use crate::fetch_state::{FetchStateTracker, FetchWindow};
use crate::ingest::types::{NewsProvider, ProviderError};
use crate::model::{FetchStateRecord, NewRawItem, Scope};
use crate::pacer::Pacer;
use crate::store::{NewsStore, RawStore, StoreError};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_fetched_total", "Articles returned by providers.");
        describe_counter!("ingest_stored_total", "New raw items written.");
        describe_counter!(
            "ingest_duplicates_total",
            "Fetched articles already present in the raw store."
        );
        describe_counter!(
            "ingest_provider_errors_total",
            "Provider fetch/parse errors."
        );
        describe_histogram!("ingest_parse_ms", "Provider parse time in milliseconds.");
    });
}

/// Normalize text: decode entities, strip tags, collapse whitespace, cap length.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Curly quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 5) Trailing sentence punctuation
    while let Some(last) = out.chars().last() {
        if matches!(last, '!' | '?' | '.' | ',') {
            out.pop();
        } else {
            break;
        }
    }

    // 6) Length cap: 2000 chars
    if out.chars().count() > 2000 {
        out = out.chars().take(2000).collect();
    }

    out
}

/// Provider plus the pacer every call to it goes through.
#[derive(Clone)]
pub struct PacedProvider {
    pub provider: Arc<dyn NewsProvider>,
    pub pacer: Arc<Pacer>,
}

impl PacedProvider {
    pub fn new(provider: Arc<dyn NewsProvider>, min_interval: std::time::Duration) -> Self {
        Self {
            provider,
            pacer: Arc::new(Pacer::new(min_interval)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.provider.name()
    }
}

/// Result of one `(scope, provider)` fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct PairOutcome {
    pub scope: Scope,
    pub provider: &'static str,
    pub window: FetchWindow,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// `None` when nothing usable came back.
    pub committed: Option<FetchStateRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Transient: logged, fetch state left alone, retried next invocation.
    #[error("provider {provider} failed for {scope}: {source}")]
    Provider {
        provider: &'static str,
        scope: Scope,
        #[source]
        source: ProviderError,
    },

    /// Infrastructure: aborts the invocation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub pairs: Vec<PairOutcome>,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub provider_errors: usize,
}

/// Fetch step: window → provider → raw store → fetch state.
pub struct Ingestor {
    store: Arc<dyn NewsStore>,
    tracker: FetchStateTracker,
    providers: Vec<PacedProvider>,
    concurrency: usize,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn NewsStore>,
        tracker: FetchStateTracker,
        providers: Vec<PacedProvider>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            tracker,
            providers,
            concurrency: concurrency.max(1),
        }
    }

    /// Fetch one pair. Fetch state advances only once every fetched row is stored.
    pub async fn ingest_pair(
        &self,
        scope: &Scope,
        provider: &PacedProvider,
        now: DateTime<Utc>,
    ) -> Result<PairOutcome, IngestError> {
        ensure_metrics_described();
        let name = provider.name();
        let window = self.tracker.next_window(scope, name, now).await?;

        provider.pacer.wait_turn().await;
        let articles = match provider.provider.fetch(scope, window.from, window.to).await {
            Ok(v) => v,
            Err(source) => {
                counter!("ingest_provider_errors_total", "provider" => name).increment(1);
                return Err(IngestError::Provider {
                    provider: name,
                    scope: scope.clone(),
                    source,
                });
            }
        };
        counter!("ingest_fetched_total", "provider" => name).increment(articles.len() as u64);

        let items: Vec<NewRawItem> = articles
            .into_iter()
            .map(|a| NewRawItem::from_article(scope, name, a))
            .collect();
        let stats = self.store.bulk_insert_raw(&items).await?;
        counter!("ingest_stored_total", "provider" => name).increment(stats.inserted as u64);
        counter!("ingest_duplicates_total", "provider" => name)
            .increment(stats.duplicates as u64);

        let committed = if items.is_empty() {
            None
        } else {
            // Duplicates may be attributed to another provider in the raw store,
            // so the batch's own timestamps count as observed too.
            let batch_max = items.iter().map(|i| i.published_at).max();
            let stored_max = self.tracker.latest_observed(scope, name).await?;
            let observed = batch_max.max(stored_max);
            self.tracker
                .commit(
                    scope,
                    name,
                    &window,
                    observed,
                    stats.total as u64,
                    stats.inserted as u64,
                    now,
                )
                .await?
        };

        tracing::info!(
            target: "ingest",
            scope = %scope,
            provider = name,
            fetched = stats.total,
            inserted = stats.inserted,
            duplicates = stats.duplicates,
            advanced = committed.is_some(),
            "pair fetched"
        );

        Ok(PairOutcome {
            scope: scope.clone(),
            provider: name,
            window,
            fetched: stats.total,
            inserted: stats.inserted,
            duplicates: stats.duplicates,
            committed,
        })
    }

    /// Every supported `(scope, provider)` pair, bounded concurrency.
    /// Provider errors are counted; the first store error aborts.
    pub async fn ingest_all(
        &self,
        scopes: &[Scope],
        now: DateTime<Utc>,
    ) -> Result<IngestReport, StoreError> {
        // owned pairs, boxed: the fetch step has to stay `Send` for `tokio::spawn`
        let jobs: Vec<BoxFuture<'_, Result<PairOutcome, IngestError>>> = scopes
            .iter()
            .flat_map(|s| {
                self.providers
                    .iter()
                    .filter(move |p| p.provider.supports(s))
                    .map(move |p| (s.clone(), p.clone()))
            })
            .map(move |(scope, p)| async move { self.ingest_pair(&scope, &p, now).await }.boxed())
            .collect();

        let results: Vec<Result<PairOutcome, IngestError>> = stream::iter(jobs)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = IngestReport::default();
        for r in results {
            match r {
                Ok(o) => {
                    report.fetched += o.fetched;
                    report.inserted += o.inserted;
                    report.duplicates += o.duplicates;
                    report.pairs.push(o);
                }
                Err(IngestError::Provider {
                    provider,
                    scope,
                    source,
                }) => {
                    tracing::warn!(
                        target: "ingest",
                        provider,
                        scope = %scope,
                        error = %source,
                        "provider error; window not advanced"
                    );
                    report.provider_errors += 1;
                }
                Err(IngestError::Store(e)) => return Err(e),
            }
        }
        Ok(report)
    }
}
