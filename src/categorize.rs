// src/categorize.rs
//! # Categorization Engine
//! Moves raw items PENDING → PROCESSING → {DONE, FAILED} and writes the matching
//! canonical article; re-attempts canonical rows stuck in UNCATEGORIZED.
//!
//! - Calls go through a semaphore (`concurrency_limit` permits); the permit is
//!   held for the classifier call only, never across a backoff sleep.
//! - Throttling/transient errors retry up to `max_retries` times with
//!   [`backoff_delay`]; once exhausted the batch lands UNCATEGORIZED.
//! - Permanent errors land ERROR straight away with the detail verbatim.
//! - Consecutive batches are spaced by `delay_between_batches`, independent of backoff.

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::classify::{resolve_label, ClassifyError, ClassifyInput, DynClassifier};
use crate::config::CategorizeConfig;
use crate::fingerprint;
use crate::model::{ArticleUpsert, Categorization, RawItem};
use crate::pacer::Pacer;
use crate::store::{ArticleStore, NewsStore, RawStore, StoreResult};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "categorize_items_total",
            "Items written by the categorization engine, by outcome."
        );
        describe_counter!(
            "classify_retries_total",
            "Classifier calls retried after a transient failure."
        );
        describe_histogram!("classify_call_ms", "Classifier call latency in milliseconds.");
        describe_gauge!("raw_pending_items", "Raw items still PENDING after a drain.");
    });
}

/// Linear backoff: `base * (attempt + 1)`, i.e. 5s, 10s, 15s… for a 5s base.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(attempt.saturating_add(1))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CategorizeStats {
    /// Items this run actually wrote an outcome for.
    pub processed: usize,
    pub categorized: usize,
    /// Transient failures (UNCATEGORIZED).
    pub uncategorized: usize,
    /// Permanent failures (ERROR).
    pub errored: usize,
    /// Stale PROCESSING items returned to PENDING first.
    pub reclaimed: u64,
    pub batches: usize,
}

impl CategorizeStats {
    fn record(&mut self, outcome: &Categorization) {
        self.processed += 1;
        match outcome {
            Categorization::Categorized { .. } => self.categorized += 1,
            Categorization::Deferred { .. } => self.uncategorized += 1,
            Categorization::Rejected { .. } => self.errored += 1,
        }
    }

    pub fn merge(&mut self, other: &CategorizeStats) {
        self.processed += other.processed;
        self.categorized += other.categorized;
        self.uncategorized += other.uncategorized;
        self.errored += other.errored;
        self.reclaimed += other.reclaimed;
        self.batches += other.batches;
    }
}

fn outcome_tag(o: &Categorization) -> &'static str {
    match o {
        Categorization::Categorized { .. } => "categorized",
        Categorization::Deferred { .. } => "uncategorized",
        Categorization::Rejected { .. } => "error",
    }
}

pub struct CategorizationEngine {
    store: Arc<dyn NewsStore>,
    classifier: DynClassifier,
    cfg: CategorizeConfig,
    gate: Arc<Semaphore>,
    batch_pacer: Pacer,
}

impl CategorizationEngine {
    pub fn new(store: Arc<dyn NewsStore>, classifier: DynClassifier, cfg: CategorizeConfig) -> Self {
        let gate = Arc::new(Semaphore::new(cfg.concurrency_limit.max(1)));
        Self::with_gate(store, classifier, cfg, gate)
    }

    /// Share one admission gate between engines that hit the same classifier.
    pub fn with_gate(
        store: Arc<dyn NewsStore>,
        classifier: DynClassifier,
        cfg: CategorizeConfig,
        gate: Arc<Semaphore>,
    ) -> Self {
        let batch_pacer = Pacer::new(cfg.delay_between_batches());
        Self {
            store,
            classifier,
            cfg,
            gate,
            batch_pacer,
        }
    }

    /// Classify up to `batch_size` items. Always returns one outcome per input.
    pub async fn categorize_batch(&self, inputs: &[ClassifyInput]) -> Vec<Categorization> {
        ensure_metrics_described();

        let mut outcomes: Vec<Option<Categorization>> = vec![None; inputs.len()];
        let mut call_idx = Vec::with_capacity(inputs.len());
        let mut call_inputs = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            if input.title.trim().is_empty() && input.body.trim().is_empty() {
                outcomes[i] = Some(Categorization::Rejected {
                    detail: "malformed input: empty title and body".into(),
                });
            } else {
                call_idx.push(i);
                call_inputs.push(input.clone());
            }
        }

        if !call_inputs.is_empty() {
            self.batch_pacer.wait_turn().await;
            let results = self.call_with_retry(&call_inputs).await;
            // the pause between batches starts once this one has settled
            self.batch_pacer.mark().await;
            for (i, outcome) in call_idx.into_iter().zip(results) {
                outcomes[i] = Some(outcome);
            }
        }

        outcomes
            .into_iter()
            .map(|o| {
                o.unwrap_or_else(|| Categorization::Rejected {
                    detail: "no outcome produced".into(),
                })
            })
            .collect()
    }

    async fn call_with_retry(&self, inputs: &[ClassifyInput]) -> Vec<Categorization> {
        let mut attempt: u32 = 0;
        loop {
            let result = match self.gate.acquire().await {
                Ok(_permit) => {
                    let t0 = std::time::Instant::now();
                    let r = self.classifier.classify(inputs).await;
                    histogram!("classify_call_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
                    r
                }
                Err(_) => Err(ClassifyError::Transport("admission gate closed".into())),
            };

            match result {
                Ok(labels) if labels.len() == inputs.len() => {
                    return labels
                        .iter()
                        .map(|l| match resolve_label(l) {
                            Ok((category, secondary_label)) => Categorization::Categorized {
                                category,
                                secondary_label,
                            },
                            Err(detail) => Categorization::Rejected { detail },
                        })
                        .collect();
                }
                Ok(labels) => {
                    let detail = format!(
                        "unparseable response: expected {} labels, got {}",
                        inputs.len(),
                        labels.len()
                    );
                    warn!(target: "categorize", expected = inputs.len(), got = labels.len(), "label count mismatch");
                    return vec![Categorization::Rejected { detail }; inputs.len()];
                }
                Err(e) if e.is_retryable() && attempt < self.cfg.max_retries => {
                    let delay = backoff_delay(attempt, self.cfg.backoff_base());
                    warn!(
                        target: "categorize",
                        kind = e.kind_tag(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "transient classifier failure; backing off"
                    );
                    counter!("classify_retries_total", "kind" => e.kind_tag()).increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    let detail = format!("retries exhausted after {} attempts: {e}", attempt + 1);
                    warn!(target: "categorize", kind = e.kind_tag(), attempts = attempt + 1, "giving up; batch stays UNCATEGORIZED");
                    return vec![Categorization::Deferred { detail }; inputs.len()];
                }
                Err(e) => {
                    warn!(target: "categorize", kind = e.kind_tag(), "permanent classifier failure");
                    return vec![Categorization::Rejected { detail: e.to_string() }; inputs.len()];
                }
            }
        }
    }

    /// Claim, classify and settle one slice of pending raw items.
    /// Items someone else already claimed are skipped.
    pub async fn process_raw_batch(
        &self,
        items: &[RawItem],
        now: DateTime<Utc>,
    ) -> StoreResult<CategorizeStats> {
        let ids: Vec<i64> = items.iter().map(|i| i.id).collect();
        let claimed = self.store.claim_raw(&ids, now).await?;
        let batch: Vec<&RawItem> = items.iter().filter(|i| claimed.contains(&i.id)).collect();
        let mut stats = CategorizeStats::default();
        if batch.is_empty() {
            return Ok(stats);
        }

        let inputs: Vec<ClassifyInput> = batch
            .iter()
            .map(|i| ClassifyInput {
                title: i.title.clone(),
                body: i.summary.clone(),
            })
            .collect();
        let outcomes = self.categorize_batch(&inputs).await;
        stats.batches = 1;

        for (item, outcome) in batch.into_iter().zip(outcomes) {
            self.store
                .upsert_article(&ArticleUpsert::from_raw(item, outcome.clone()))
                .await?;
            match &outcome {
                Categorization::Categorized { .. } => self.store.mark_raw_done(item.id).await?,
                Categorization::Deferred { detail } | Categorization::Rejected { detail } => {
                    self.store.mark_raw_failed(item.id, detail).await?
                }
            }
            debug!(
                target: "categorize",
                raw_id = item.id,
                fp = fingerprint::short(&item.fingerprint),
                category = %outcome.category(),
                "raw item settled"
            );
            counter!("categorize_items_total", "outcome" => outcome_tag(&outcome)).increment(1);
            stats.record(&outcome);
        }
        Ok(stats)
    }

    /// Drain every PENDING raw item, returning stale PROCESSING items to the queue first.
    pub async fn drain_pending(&self, now: DateTime<Utc>) -> StoreResult<CategorizeStats> {
        ensure_metrics_described();
        let mut stats = CategorizeStats::default();
        let stale_before = now - self.cfg.stale_after();
        stats.reclaimed = self.store.reclaim_stale(stale_before).await?;
        if stats.reclaimed > 0 {
            info!(target: "categorize", reclaimed = stats.reclaimed, "stale PROCESSING items returned to PENDING");
        }

        loop {
            let page = self.store.pending_raw(self.cfg.pending_page_size).await?;
            if page.is_empty() {
                break;
            }
            let before = stats.processed;
            for chunk in page.chunks(self.cfg.batch_size.max(1)) {
                let s = self.process_raw_batch(chunk, now).await?;
                stats.merge(&s);
            }
            if stats.processed == before {
                // every item on the page was claimed elsewhere
                break;
            }
        }

        let pending = self.store.count_pending().await?;
        gauge!("raw_pending_items").set(pending as f64);
        info!(
            target: "categorize",
            processed = stats.processed,
            categorized = stats.categorized,
            uncategorized = stats.uncategorized,
            errored = stats.errored,
            pending,
            "pending drain finished"
        );
        Ok(stats)
    }

    /// Re-attempt up to `limit` UNCATEGORIZED canonical rows, in place. ERROR rows are never read.
    pub async fn recategorize(&self, limit: usize) -> StoreResult<CategorizeStats> {
        ensure_metrics_described();
        let rows = self.store.uncategorized_articles(limit).await?;
        let mut stats = CategorizeStats::default();

        for chunk in rows.chunks(self.cfg.batch_size.max(1)) {
            let inputs: Vec<ClassifyInput> = chunk
                .iter()
                .map(|a| ClassifyInput {
                    title: a.title.clone(),
                    body: a.summary.clone(),
                })
                .collect();
            let outcomes = self.categorize_batch(&inputs).await;
            stats.batches += 1;
            for (article, outcome) in chunk.iter().zip(outcomes) {
                self.store.update_article(article.id, &outcome).await?;
                counter!("categorize_items_total", "outcome" => outcome_tag(&outcome)).increment(1);
                stats.record(&outcome);
            }
        }

        info!(
            target: "categorize",
            attempted = stats.processed,
            categorized = stats.categorized,
            still_uncategorized = stats.uncategorized,
            errored = stats.errored,
            "recategorize finished"
        );
        Ok(stats)
    }
}
