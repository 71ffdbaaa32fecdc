// src/ingest/providers/finnhub.rs
//! Finnhub: `/company-news` per symbol, `/news?category=..` for the `ALL` scope.
//!
//! The company-news endpoint is date-granular, so results are clipped to the
//! requested window after the call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::histogram;
use serde::Deserialize;
use std::time::Duration;

use crate::ingest::normalize_text;
use crate::ingest::types::{clip_to_window, NewsProvider, ProviderError};
use crate::model::{RawArticle, Scope};

pub const NAME: &str = "finnhub";
const BASE_URL: &str = "https://finnhub.io/api/v1";

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(default)]
    headline: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    url: String,
    /// unix seconds
    #[serde(default)]
    datetime: i64,
}

pub struct FinnhubProvider {
    mode: Mode,
    categories: Vec<String>,
}

enum Mode {
    Fixture(String),
    Http {
        client: reqwest::Client,
        base_url: String,
        api_key: String,
    },
}

impl FinnhubProvider {
    /// Serve a canned JSON array (same shape as the API) for every call.
    pub fn from_fixture_str(s: &str) -> Self {
        Self {
            mode: Mode::Fixture(s.to_string()),
            categories: vec!["general".into()],
        }
    }

    pub fn new(
        api_key: impl Into<String>,
        categories: Vec<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
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
            categories,
        })
    }

    fn parse_items_from_str(s: &str) -> Result<Vec<RawArticle>, ProviderError> {
        let t0 = std::time::Instant::now();
        let values: Vec<serde_json::Value> = serde_json::from_str(s)?;
        let mut out = Vec::with_capacity(values.len());
        for v in values {
            let it: Item = match serde_json::from_value(v.clone()) {
                Ok(it) => it,
                Err(e) => {
                    tracing::debug!(target: "ingest", provider = NAME, error = %e, "skipping undecodable item");
                    continue;
                }
            };
            let Some(published_at) = DateTime::<Utc>::from_timestamp(it.datetime, 0) else {
                continue;
            };
            if it.datetime <= 0 || it.url.trim().is_empty() {
                continue;
            }
            out.push(RawArticle {
                url: it.url.trim().to_string(),
                title: normalize_text(&it.headline),
                summary: normalize_text(&it.summary),
                published_at,
                payload: v,
            });
        }
        histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(out)
    }

    async fn get_json(
        client: &reqwest::Client,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<String, ProviderError> {
        let resp = client.get(url).query(query).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl NewsProvider for FinnhubProvider {
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
            } => match scope {
                Scope::Symbol(symbol) => {
                    let body = Self::get_json(
                        client,
                        &format!("{base_url}/company-news"),
                        &[
                            ("symbol", symbol.clone()),
                            ("from", from.format("%Y-%m-%d").to_string()),
                            ("to", to.format("%Y-%m-%d").to_string()),
                            ("token", api_key.clone()),
                        ],
                    )
                    .await?;
                    Self::parse_items_from_str(&body)?
                }
                Scope::All => {
                    let mut all = Vec::new();
                    for category in &self.categories {
                        let body = Self::get_json(
                            client,
                            &format!("{base_url}/news"),
                            &[("category", category.clone()), ("token", api_key.clone())],
                        )
                        .await?;
                        all.extend(Self::parse_items_from_str(&body)?);
                    }
                    all
                }
            },
        };
        Ok(clip_to_window(items, from, to))
    }

    fn name(&self) -> &'static str {
        NAME
    }
}
