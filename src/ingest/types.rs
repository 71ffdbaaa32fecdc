// src/ingest/types.rs
use chrono::{DateTime, Utc};

use crate::model::{RawArticle, Scope};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("http {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Decode(e.to_string())
    }
}

/// News source. Returns articles published in `[from, to)` for `scope`;
/// the caller is responsible for rate limiting.
#[async_trait::async_trait]
pub trait NewsProvider: Send + Sync {
    async fn fetch(
        &self,
        scope: &Scope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawArticle>, ProviderError>;

    /// Stable id; stored alongside raw items and fetch state.
    fn name(&self) -> &'static str;

    /// Whether this provider has anything to say about `scope`.
    fn supports(&self, _scope: &Scope) -> bool {
        true
    }
}

/// Drop articles outside `[from, to)` and ones with no URL.
pub fn clip_to_window(
    items: Vec<RawArticle>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<RawArticle> {
    items
        .into_iter()
        .filter(|a| !a.url.trim().is_empty() && a.published_at >= from && a.published_at < to)
        .collect()
}
