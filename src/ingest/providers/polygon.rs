// src/ingest/providers/polygon.rs
//! Polygon `/v2/reference/news`. Timestamps are RFC 3339; the window is passed
//! through as `published_utc.gte` / `published_utc.lt`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use metrics::histogram;
use serde::Deserialize;
use std::time::Duration;

use crate::ingest::normalize_text;
use crate::ingest::types::{clip_to_window, NewsProvider, ProviderError};
use crate::model::{RawArticle, Scope};

pub const NAME: &str = "polygon";
const BASE_URL: &str = "https://api.polygon.io";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    article_url: String,
    published_utc: Option<String>,
}

pub struct PolygonProvider {
    mode: Mode,
    limit: u32,
}

enum Mode {
    Fixture(String),
    Http {
        client: reqwest::Client,
        base_url: String,
        api_key: String,
    },
}

impl PolygonProvider {
    pub fn from_fixture_str(s: &str) -> Self {
        Self {
            mode: Mode::Fixture(s.to_string()),
            limit: 200,
        }
    }

    pub fn new(api_key: impl Into<String>, limit: u32, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("market-news-pipeline/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            mode: Mode::Http {
                client,
                base_url: BASE_URL.to_string(),
                api_key: api_key.into(),
            },
            limit: limit.clamp(1, 1000),
        })
    }

    fn parse_items_from_str(s: &str) -> Result<Vec<RawArticle>, ProviderError> {
        let t0 = std::time::Instant::now();
        let env: Envelope = serde_json::from_str(s)?;
        let mut out = Vec::with_capacity(env.results.len());
        for v in env.results {
            let Ok(it) = serde_json::from_value::<Item>(v.clone()) else {
                continue;
            };
            let published_at = it
                .published_utc
                .as_deref()
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|dt| dt.with_timezone(&Utc));
            let Some(published_at) = published_at else {
                continue;
            };
            if it.article_url.trim().is_empty() {
                continue;
            }
            out.push(RawArticle {
                url: it.article_url.trim().to_string(),
                title: normalize_text(&it.title),
                summary: normalize_text(&it.description),
                published_at,
                payload: v,
            });
        }
        histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(out)
    }
}

#[async_trait]
impl NewsProvider for PolygonProvider {
    async fn fetch(
        &self,
        scope: &Scope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawArticle>, ProviderError> {
        let items = match &self.mode {
            Mode::Fixture(s) => Self::parse_items_from_str(s)?,
            Mode::Http {
                client,
                base_url,
                api_key,
            } => {
                let mut query = vec![
                    (
                        "published_utc.gte",
                        from.to_rfc3339_opts(SecondsFormat::Secs, true),
                    ),
                    (
                        "published_utc.lt",
                        to.to_rfc3339_opts(SecondsFormat::Secs, true),
                    ),
                    ("order", "desc".to_string()),
                    ("sort", "published_utc".to_string()),
                    ("limit", self.limit.to_string()),
                    ("apiKey", api_key.clone()),
                ];
                if let Some(symbol) = scope.as_symbol() {
                    query.push(("ticker", symbol.to_string()));
                }
                let resp = client
                    .get(format!("{base_url}/v2/reference/news"))
                    .query(&query)
                    .send()
                    .await?;
                let status = resp.status();
                let body = resp.text().await?;
                if !status.is_success() {
                    return Err(ProviderError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                Self::parse_items_from_str(&body)?
            }
        };
        Ok(clip_to_window(items, from, to))
    }

    fn name(&self) -> &'static str {
        NAME
    }
}
