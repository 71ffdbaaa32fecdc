// src/pipeline.rs
//! # Pipeline Orchestrator
//! Runs the configured task list once per invocation, lowest priority number
//! first. Per-item and per-provider failures are folded into the [`RunSummary`];
//! a store error stops the invocation where it is.

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::categorize::{CategorizationEngine, CategorizeStats};
use crate::classify::DynClassifier;
use crate::config::{PipelineConfig, TaskSpec};
use crate::fetch_state::FetchStateTracker;
use crate::ingest::types::NewsProvider;
use crate::ingest::{IngestReport, Ingestor, PacedProvider};
use crate::model::Scope;
use crate::store::{ArticleStore, NewsStore, StoreError};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_runs_total", "Pipeline invocations, by status.");
        describe_gauge!("pipeline_last_run_ts", "Unix ts when the pipeline last finished.");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ProcessPendingRaw,
    RecategorizeUncategorized,
    FetchAndProcess,
    ScrubPlaceholders,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ProcessPendingRaw => "process_pending_raw",
            TaskKind::RecategorizeUncategorized => "recategorize_uncategorized",
            TaskKind::FetchAndProcess => "fetch_and_process",
            TaskKind::ScrubPlaceholders => "scrub_placeholders",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "process_pending_raw" => Ok(TaskKind::ProcessPendingRaw),
            "recategorize_uncategorized" => Ok(TaskKind::RecategorizeUncategorized),
            "fetch_and_process" => Ok(TaskKind::FetchAndProcess),
            "scrub_placeholders" => Ok(TaskKind::ScrubPlaceholders),
            other => Err(format!("unknown pipeline task {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTask {
    pub kind: TaskKind,
    pub priority: u32,
}

/// Order tasks by priority; ties keep their configured order.
pub fn plan_tasks(specs: &[TaskSpec]) -> Result<Vec<ScheduledTask>, String> {
    let mut out = specs
        .iter()
        .map(|t| -> Result<ScheduledTask, String> {
            Ok(ScheduledTask {
                kind: t.name.parse()?,
                priority: t.priority,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;
    out.sort_by_key(|t| t.priority);
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tasks_run: Vec<TaskKind>,
    pub fetched: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub provider_errors: usize,
    pub windows_advanced: usize,
    pub categorized: usize,
    pub uncategorized: usize,
    pub errored: usize,
    /// UNCATEGORIZED rows that got a real category this run.
    pub recategorized: usize,
    pub reclaimed: u64,
    pub scrubbed: u64,
}

impl RunSummary {
    fn add_ingest(&mut self, r: &IngestReport) {
        self.fetched += r.fetched;
        self.stored += r.inserted;
        self.duplicates += r.duplicates;
        self.provider_errors += r.provider_errors;
        self.windows_advanced += r.pairs.iter().filter(|p| p.committed.is_some()).count();
    }

    fn add_drain(&mut self, s: &CategorizeStats) {
        self.categorized += s.categorized;
        self.uncategorized += s.uncategorized;
        self.errored += s.errored;
        self.reclaimed += s.reclaimed;
    }

    fn add_recategorize(&mut self, s: &CategorizeStats) {
        self.recategorized += s.categorized;
        self.uncategorized += s.uncategorized;
        self.errored += s.errored;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched={} stored={} duplicates={} categorized={} recategorized={} uncategorized={} errored={} provider_errors={}",
            self.fetched,
            self.stored,
            self.duplicates,
            self.categorized,
            self.recategorized,
            self.uncategorized,
            self.errored,
            self.provider_errors
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("task {task} aborted the run: {source}")]
pub struct PipelineError {
    pub task: TaskKind,
    #[source]
    pub source: StoreError,
}

pub struct Pipeline {
    store: Arc<dyn NewsStore>,
    ingestor: Ingestor,
    engine: CategorizationEngine,
    scopes: Vec<Scope>,
    plan: Vec<ScheduledTask>,
    recategorize_limit: usize,
}

impl Pipeline {
    pub fn new(
        cfg: &PipelineConfig,
        store: Arc<dyn NewsStore>,
        classifier: DynClassifier,
        providers: Vec<Arc<dyn NewsProvider>>,
    ) -> anyhow::Result<Self> {
        let plan = plan_tasks(&cfg.tasks).map_err(anyhow::Error::msg)?;
        let tracker = FetchStateTracker::new(
            store.clone(),
            cfg.fetch.buffer(),
            cfg.fetch.default_lookback(),
        );
        let paced = providers
            .into_iter()
            .map(|p| PacedProvider::new(p, cfg.fetch.provider_min_interval()))
            .collect();
        let ingestor = Ingestor::new(store.clone(), tracker, paced, cfg.fetch.concurrency);
        let engine = CategorizationEngine::new(store.clone(), classifier, cfg.categorize.clone());
        Ok(Self {
            store,
            ingestor,
            engine,
            scopes: cfg.scopes.scopes(),
            plan,
            recategorize_limit: cfg.categorize.recategorize_limit,
        })
    }

    pub fn plan(&self) -> &[ScheduledTask] {
        &self.plan
    }

    /// One invocation: every planned task, in priority order.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RunSummary, PipelineError> {
        ensure_metrics_described();
        let mut summary = RunSummary {
            started_at: Some(now),
            ..Default::default()
        };

        for task in &self.plan {
            info!(target: "pipeline", task = %task.kind, priority = task.priority, "task start");
            let res = self.run_task(task.kind, now, &mut summary).await;
            if let Err(source) = res {
                error!(target: "pipeline", task = %task.kind, error = %source, "store failure; aborting run");
                counter!("pipeline_runs_total", "status" => "aborted").increment(1);
                return Err(PipelineError {
                    task: task.kind,
                    source,
                });
            }
            summary.tasks_run.push(task.kind);
        }

        summary.finished_at = Some(Utc::now().max(now));
        counter!("pipeline_runs_total", "status" => "ok").increment(1);
        gauge!("pipeline_last_run_ts").set(Utc::now().timestamp() as f64);
        info!(target: "pipeline", summary = %summary, "run finished");
        Ok(summary)
    }

    async fn run_task(
        &self,
        kind: TaskKind,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<(), StoreError> {
        match kind {
            TaskKind::ProcessPendingRaw => {
                let s = self.engine.drain_pending(now).await?;
                summary.add_drain(&s);
            }
            TaskKind::RecategorizeUncategorized => {
                let s = self.engine.recategorize(self.recategorize_limit).await?;
                summary.add_recategorize(&s);
            }
            TaskKind::FetchAndProcess => {
                let report = self.ingestor.ingest_all(&self.scopes, now).await?;
                summary.add_ingest(&report);
                let s = self.engine.drain_pending(now).await?;
                summary.add_drain(&s);
            }
            TaskKind::ScrubPlaceholders => {
                summary.scrubbed += self.store.scrub_placeholder_labels().await?;
            }
        }
        Ok(())
    }
}

/// Outcome of the most recent scheduled invocation, shared with the ops API.
#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub at: DateTime<Utc>,
    pub summary: Option<RunSummary>,
    pub error: Option<String>,
}

pub type SharedLastRun = Arc<RwLock<Option<LastRun>>>;

pub fn record_run(slot: &SharedLastRun, at: DateTime<Utc>, res: &Result<RunSummary, PipelineError>) {
    let entry = match res {
        Ok(s) => LastRun {
            at,
            summary: Some(s.clone()),
            error: None,
        },
        Err(e) => LastRun {
            at,
            summary: None,
            error: Some(e.to_string()),
        },
    };
    match slot.write() {
        Ok(mut g) => *g = Some(entry),
        Err(_) => tracing::warn!(target: "pipeline", "last-run slot poisoned"),
    }
}

/// Run the pipeline every `interval` until the task is aborted.
/// Invocations never overlap: the next tick waits for the current run.
pub fn spawn_scheduler(
    pipeline: Arc<Pipeline>,
    interval: Duration,
    last_run: SharedLastRun,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let res = pipeline.run_once(now).await;
            record_run(&last_run, now, &res);
            if let Err(e) = &res {
                tracing::warn!(target: "pipeline", error = %e, "scheduled run failed; next tick retries");
            }
        }
    })
}
