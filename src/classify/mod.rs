// src/classify/mod.rs
//! Classifier seam: a batch of `{title, body}` in, one raw label per item out.
//!
//! Every failure goes through [`ClassifyError::failure_kind`], the single
//! retryable/permanent decision used by both the pending-drain and the
//! recategorize paths.

pub mod llm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ClassifierConfig;
use crate::store::PLACEHOLDER_LABEL;
use crate::taxonomy::Category;

pub use llm::LlmClassifier;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifyInput {
    pub title: String,
    pub body: String,
}

/// What the model said, before it is checked against the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLabel {
    pub category: String,
    #[serde(default, alias = "secondaryLabel", alias = "secondary_category")]
    pub secondary_label: String,
}

impl RawLabel {
    pub fn new(category: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            secondary_label: secondary.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry in-process; after exhaustion the item lands UNCATEGORIZED.
    Transient,
    /// No retry; the item lands ERROR.
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    #[error("HTTP {status}: {body}")]
    Throttled { status: u16, body: String },

    #[error("HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("unparseable response: {0}")]
    Malformed(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl ClassifyError {
    /// Map an HTTP failure status to the matching variant.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            429 => ClassifyError::Throttled { status, body },
            408 | 500..=599 => ClassifyError::Upstream { status, body },
            _ => ClassifyError::Rejected { status, body },
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ClassifyError::Throttled { .. }
            | ClassifyError::Upstream { .. }
            | ClassifyError::Transport(_) => FailureKind::Transient,
            ClassifyError::Rejected { .. } | ClassifyError::Malformed(_) => FailureKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }

    /// Short tag for logs and metric labels.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            ClassifyError::Throttled { .. } => "throttled",
            ClassifyError::Upstream { .. } => "upstream",
            ClassifyError::Rejected { .. } => "rejected",
            ClassifyError::Malformed(_) => "malformed",
            ClassifyError::Transport(_) => "transport",
        }
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// One label per input, same order. A length mismatch is the caller's to detect.
    async fn classify(&self, batch: &[ClassifyInput]) -> Result<Vec<RawLabel>, ClassifyError>;

    fn name(&self) -> &'static str;
}

pub type DynClassifier = Arc<dyn Classifier>;

/// Check a raw label against the taxonomy. Sentinels are not assignable.
pub fn resolve_label(label: &RawLabel) -> Result<(Category, String), String> {
    match label.category.parse::<Category>() {
        Ok(c) if !c.is_sentinel() => Ok((c, clean_secondary_label(&label.secondary_label))),
        Ok(c) => Err(format!("unparseable response: reserved label {c}")),
        Err(e) => Err(format!("unparseable response: {e}")),
    }
}

/// Single line, ASCII, at most 80 chars; the placeholder text becomes "".
pub fn clean_secondary_label(input: &str) -> String {
    let mut out = String::with_capacity(80);
    let mut prev_space = false;
    for ch in input.chars() {
        let c = match ch {
            '\r' | '\n' | '\t' => ' ',
            c if c.is_ascii() => c,
            _ => ' ',
        };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
        if out.len() >= 80 {
            break;
        }
    }
    let out = out.trim().to_string();
    if out.eq_ignore_ascii_case(PLACEHOLDER_LABEL) {
        String::new()
    } else {
        out
    }
}

/// Deterministic keyword classifier for local runs and tests (`AI_TEST_MODE=mock`).
#[derive(Debug, Clone, Default)]
pub struct MockClassifier;

impl MockClassifier {
    fn label_for(input: &ClassifyInput) -> RawLabel {
        let text = format!("{} {}", input.title, input.body).to_ascii_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| text.contains(w));
        let category = if has(&["earnings", "quarter", "revenue", "guidance"]) {
            Category::Earnings
        } else if has(&["acquire", "acquisition", "merger", "buyout"]) {
            Category::MergersAcquisitions
        } else if has(&["upgrade", "downgrade", "price target"]) {
            Category::AnalystRating
        } else if has(&["lawsuit", "regulator", "fine", "probe"]) {
            Category::RegulatoryLegal
        } else if has(&["ceo", "cfo", "resigns", "appoint"]) {
            Category::Management
        } else if has(&["launch", "unveil", "release"]) {
            Category::Product
        } else {
            Category::MarketMovement
        };
        RawLabel::new(category.as_str(), "")
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(&self, batch: &[ClassifyInput]) -> Result<Vec<RawLabel>, ClassifyError> {
        Ok(batch.iter().map(Self::label_for).collect())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Factory: build a classifier according to config and environment variables.
///
/// * `AI_TEST_MODE=mock` returns [`MockClassifier`].
/// * Otherwise `CLASSIFIER_API_KEY` is required; `CLASSIFIER_BASE_URL` and
///   `CLASSIFIER_MODEL` override the config file.
pub fn build_classifier_from_env(cfg: &ClassifierConfig) -> anyhow::Result<DynClassifier> {
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        tracing::info!(target: "categorize", "AI_TEST_MODE=mock, using keyword classifier");
        return Ok(Arc::new(MockClassifier));
    }

    let api_key = std::env::var("CLASSIFIER_API_KEY").map_err(|_| {
        anyhow::anyhow!("CLASSIFIER_API_KEY not set (use AI_TEST_MODE=mock for offline runs)")
    })?;
    let mut cfg = cfg.clone();
    if let Ok(url) = std::env::var("CLASSIFIER_BASE_URL") {
        cfg.base_url = url;
    }
    if let Ok(model) = std::env::var("CLASSIFIER_MODEL") {
        cfg.model = model;
    }
    Ok(Arc::new(LlmClassifier::new(api_key, &cfg)?))
}
