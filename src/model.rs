// src/model.rs
//! Records shared by the stores, the fetch step and the categorization engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::taxonomy::Category;

/// Partitioning key for fetch/state tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Scope {
    /// Market-wide news, not tied to one symbol.
    All,
    /// Ticker symbol, always uppercase.
    Symbol(String),
}

impl Scope {
    pub const ALL_TAG: &'static str = "ALL";

    pub fn symbol(s: &str) -> Self {
        Scope::Symbol(s.trim().to_ascii_uppercase())
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Scope::All => None,
            Scope::Symbol(s) => Some(s.as_str()),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str(Self::ALL_TAG),
            Scope::Symbol(s) => f.write_str(s),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.is_empty() {
            return Err("empty scope".to_string());
        }
        if t.eq_ignore_ascii_case(Self::ALL_TAG) || t.eq_ignore_ascii_case("general") {
            Ok(Scope::All)
        } else {
            Ok(Scope::symbol(t))
        }
    }
}

impl From<Scope> for String {
    fn from(s: Scope) -> Self {
        s.to_string()
    }
}

impl TryFrom<String> for Scope {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    Pending,
    Processing,
    Done,
    Failed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Pending => "PENDING",
            ProcessingState::Processing => "PROCESSING",
            ProcessingState::Done => "DONE",
            ProcessingState::Failed => "FAILED",
        }
    }
}

impl FromStr for ProcessingState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ProcessingState::Pending),
            "PROCESSING" => Ok(ProcessingState::Processing),
            "DONE" => Ok(ProcessingState::Done),
            "FAILED" => Ok(ProcessingState::Failed),
            other => Err(format!("unknown processing state {other:?}")),
        }
    }
}

/// What a provider hands back for one article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawArticle {
    pub url: String,
    pub title: String,
    pub summary: String,
    pub published_at: DateTime<Utc>,
    /// Provider-native fields, kept verbatim.
    pub payload: serde_json::Value,
}

/// Insert request for the raw store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRawItem {
    pub fingerprint: String,
    pub scope: Scope,
    pub provider: String,
    /// Canonical (normalized) URL.
    pub url: String,
    pub title: String,
    pub summary: String,
    pub published_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl NewRawItem {
    pub fn from_article(scope: &Scope, provider: &str, a: RawArticle) -> Self {
        Self {
            fingerprint: crate::fingerprint::fingerprint(&a.url),
            scope: scope.clone(),
            provider: provider.to_string(),
            url: crate::fingerprint::normalize_url(&a.url),
            title: a.title,
            summary: a.summary,
            published_at: a.published_at,
            payload: a.payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    pub id: i64,
    pub fingerprint: String,
    pub scope: Scope,
    pub provider: String,
    pub url: String,
    pub title: String,
    pub summary: String,
    pub published_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub state: ProcessingState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkInsertStats {
    pub total: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalArticle {
    pub id: i64,
    pub scope: Scope,
    pub url: String,
    pub title: String,
    pub summary: String,
    pub published_at: DateTime<Utc>,
    pub provider: String,
    pub category: Category,
    pub secondary_label: String,
    pub error_log: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of classifying one article, as written to the canonical store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Categorization {
    Categorized {
        category: Category,
        secondary_label: String,
    },
    /// Transient failure: lands as UNCATEGORIZED.
    Deferred { detail: String },
    /// Permanent failure: lands as ERROR.
    Rejected { detail: String },
}

impl Categorization {
    pub fn category(&self) -> Category {
        match self {
            Categorization::Categorized { category, .. } => *category,
            Categorization::Deferred { .. } => Category::Uncategorized,
            Categorization::Rejected { .. } => Category::Error,
        }
    }

    pub fn secondary_label(&self) -> &str {
        match self {
            Categorization::Categorized {
                secondary_label, ..
            } => secondary_label,
            _ => "",
        }
    }

    pub fn error_log(&self) -> Option<&str> {
        match self {
            Categorization::Categorized { .. } => None,
            Categorization::Deferred { detail } | Categorization::Rejected { detail } => {
                Some(detail)
            }
        }
    }
}

/// Insert-or-update request for the canonical store, keyed by `(scope, url)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleUpsert {
    pub scope: Scope,
    pub url: String,
    pub title: String,
    pub summary: String,
    pub published_at: DateTime<Utc>,
    pub provider: String,
    pub outcome: Categorization,
}

impl ArticleUpsert {
    pub fn from_raw(item: &RawItem, outcome: Categorization) -> Self {
        Self {
            scope: item.scope.clone(),
            url: item.url.clone(),
            title: item.title.clone(),
            summary: item.summary.clone(),
            published_at: item.published_at,
            provider: item.provider.clone(),
            outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchStateRecord {
    pub scope: Scope,
    pub provider: String,
    pub window_start: DateTime<Utc>,
    /// Latest provider-reported article time observed, never wall clock.
    pub window_end: DateTime<Utc>,
    pub articles_fetched: u64,
    pub articles_stored: u64,
    pub last_run_at: DateTime<Utc>,
    pub status: String,
}

/// Selector for resetting fetch state. Both `None` clears everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchStateFilter {
    pub scope: Option<Scope>,
    pub provider: Option<String>,
}

impl FetchStateFilter {
    pub fn matches(&self, scope: &Scope, provider: &str) -> bool {
        self.scope.as_ref().map_or(true, |s| s == scope)
            && self.provider.as_deref().map_or(true, |p| p == provider)
    }
}
