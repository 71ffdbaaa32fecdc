// src/config.rs
//! Pipeline configuration, loaded once and passed to each component by reference.
//!
//! Resolution order:
//! 1) `$PIPELINE_CONFIG_PATH` (must exist)
//! 2) `config/pipeline.toml`
//! 3) built-in defaults

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::Scope;
use crate::taxonomy::{Category, ExclusionList, DEFAULT_EXCLUDED};

pub const ENV_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

// Upper bounds for the chrono-backed durations; larger values are clamped.
pub const MAX_BUFFER_MINUTES: i64 = 24 * 60;
pub const MAX_LOOKBACK_HOURS: i64 = 24 * 365;
pub const MAX_STALE_PROCESSING_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub fetch: FetchConfig,
    pub categorize: CategorizeConfig,
    pub classifier: ClassifierConfig,
    pub tasks: Vec<TaskSpec>,
    pub report: ReportConfig,
    pub scopes: ScopesConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Overlap subtracted from the stored `window_end`.
    pub buffer_minutes: i64,
    /// Look-back for a pair with no fetch state yet.
    pub default_lookback_hours: i64,
    /// Minimum spacing between two calls to the same provider.
    pub provider_min_interval_ms: u64,
    /// Concurrent (scope, provider) fetches.
    pub concurrency: usize,
    pub finnhub_categories: Vec<String>,
    pub polygon_limit: u32,
    pub request_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            buffer_minutes: 1,
            default_lookback_hours: 24,
            provider_min_interval_ms: 300,
            concurrency: 2,
            finnhub_categories: vec!["general".into(), "merger".into()],
            polygon_limit: 200,
            request_timeout_secs: 30,
        }
    }
}

impl FetchConfig {
    pub fn buffer(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.buffer_minutes.clamp(0, MAX_BUFFER_MINUTES))
    }

    pub fn default_lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.default_lookback_hours.clamp(1, MAX_LOOKBACK_HOURS))
    }

    pub fn provider_min_interval(&self) -> Duration {
        Duration::from_millis(self.provider_min_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategorizeConfig {
    pub batch_size: usize,
    /// Classifier calls allowed in flight at once.
    pub concurrency_limit: usize,
    /// Retries after the first attempt, throttling/transient only.
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub delay_between_batches_ms: u64,
    /// UNCATEGORIZED rows re-attempted per invocation.
    pub recategorize_limit: usize,
    /// PROCESSING items older than this go back to PENDING at the start of a drain.
    pub stale_processing_secs: i64,
    pub pending_page_size: usize,
}

impl Default for CategorizeConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            concurrency_limit: 1,
            max_retries: 2,
            backoff_base_secs: 5,
            delay_between_batches_ms: 2_000,
            recategorize_limit: 20,
            stale_processing_secs: 900,
            pending_page_size: 50,
        }
    }
}

impl CategorizeConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn delay_between_batches(&self) -> Duration {
        Duration::from_millis(self.delay_between_batches_ms)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_processing_secs.clamp(0, MAX_STALE_PROCESSING_SECS))
    }
}

/// OpenAI-compatible chat-completions endpoint used for classification.
/// The API key always comes from the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.3,
            timeout_secs: 60,
        }
    }
}

/// Named pipeline task with a numeric priority; lower runs first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub priority: u32,
}

pub const KNOWN_TASKS: [&str; 4] = [
    "process_pending_raw",
    "recategorize_uncategorized",
    "fetch_and_process",
    "scrub_placeholders",
];

pub fn default_tasks() -> Vec<TaskSpec> {
    [
        ("process_pending_raw", 1),
        ("recategorize_uncategorized", 2),
        ("fetch_and_process", 3),
        ("scrub_placeholders", 5),
    ]
    .into_iter()
    .map(|(name, priority)| TaskSpec {
        name: name.to_string(),
        priority,
    })
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub excluded_categories: Vec<Category>,
    pub news_stack_limit: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            excluded_categories: DEFAULT_EXCLUDED.to_vec(),
            news_stack_limit: 20,
        }
    }
}

impl ReportConfig {
    pub fn exclusions(&self) -> ExclusionList {
        ExclusionList::new(self.excluded_categories.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopesConfig {
    pub symbols: Vec<String>,
    /// Also fetch market-wide news (scope `ALL`).
    pub include_all: bool,
}

impl Default for ScopesConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["AAPL".into(), "TSLA".into(), "NVDA".into()],
            include_all: true,
        }
    }
}

impl ScopesConfig {
    /// Distinct scopes in a stable order: `ALL` first (if enabled), then symbols as listed.
    pub fn scopes(&self) -> Vec<Scope> {
        let mut out = Vec::with_capacity(self.symbols.len() + 1);
        if self.include_all {
            out.push(Scope::All);
        }
        for s in &self.symbols {
            if let Ok(scope) = s.parse::<Scope>() {
                if !out.contains(&scope) {
                    out.push(scope);
                }
            }
        }
        out
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            categorize: CategorizeConfig::default(),
            classifier: ClassifierConfig::default(),
            tasks: default_tasks(),
            report: ReportConfig::default(),
            scopes: ScopesConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: PipelineConfig = toml::from_str(s).context("parsing pipeline config")?;
        cfg.validated()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_p.exists() {
            return Self::load_from(&default_p);
        }
        Ok(Self::default())
    }

    /// Clamp nonsensical numbers, reject unknown task names.
    pub fn validated(mut self) -> Result<Self> {
        let c = &mut self.categorize;
        c.batch_size = c.batch_size.max(1);
        c.concurrency_limit = c.concurrency_limit.max(1);
        c.pending_page_size = c.pending_page_size.max(c.batch_size);
        c.stale_processing_secs = c.stale_processing_secs.clamp(0, MAX_STALE_PROCESSING_SECS);

        let f = &mut self.fetch;
        f.buffer_minutes = f.buffer_minutes.clamp(0, MAX_BUFFER_MINUTES);
        f.default_lookback_hours = f.default_lookback_hours.clamp(1, MAX_LOOKBACK_HOURS);
        f.concurrency = f.concurrency.max(1);

        for t in &self.tasks {
            if !KNOWN_TASKS.contains(&t.name.as_str()) {
                bail!("unknown pipeline task {:?}", t.name);
            }
        }
        let mut names: Vec<&str> = self.tasks.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.tasks.len() {
            bail!("pipeline task listed more than once");
        }
        Ok(self)
    }
}
