// src/bootstrap.rs
//! Wiring from config + environment to live components.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::ingest::providers::{FinnhubProvider, PolygonProvider};
use crate::ingest::types::NewsProvider;
use crate::store::{MemoryStore, NewsStore, SqliteStore};

/// SQLite when a URL is given and `memory` is off; otherwise the in-process store.
pub async fn open_store(database_url: Option<&str>, memory: bool) -> anyhow::Result<Arc<dyn NewsStore>> {
    match database_url {
        Some(url) if !memory => {
            let store = SqliteStore::connect(url)
                .await
                .with_context(|| format!("opening store at {url}"))?;
            info!(target: "store", backend = "sqlite", "store ready");
            Ok(Arc::new(store))
        }
        _ => {
            info!(target: "store", backend = "memory", "store ready (not durable)");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// One provider per API key present. Key lengths only are logged.
pub fn build_providers(
    cfg: &PipelineConfig,
    finnhub_key: Option<&str>,
    polygon_key: Option<&str>,
) -> anyhow::Result<Vec<Arc<dyn NewsProvider>>> {
    let timeout = Duration::from_secs(cfg.fetch.request_timeout_secs.max(1));
    let mut out: Vec<Arc<dyn NewsProvider>> = Vec::new();

    match finnhub_key.filter(|k| !k.trim().is_empty()) {
        Some(key) => {
            info!(target: "ingest", provider = "finnhub", key_len = key.len(), "provider enabled");
            out.push(Arc::new(FinnhubProvider::new(
                key,
                cfg.fetch.finnhub_categories.clone(),
                timeout,
            )?));
        }
        None => warn!(target: "ingest", provider = "finnhub", "FINNHUB_API_KEY missing; provider disabled"),
    }

    match polygon_key.filter(|k| !k.trim().is_empty()) {
        Some(key) => {
            info!(target: "ingest", provider = "polygon", key_len = key.len(), "provider enabled");
            out.push(Arc::new(PolygonProvider::new(
                key,
                cfg.fetch.polygon_limit,
                timeout,
            )?));
        }
        None => warn!(target: "ingest", provider = "polygon", "POLYGON_API_KEY missing; provider disabled"),
    }

    Ok(out)
}
