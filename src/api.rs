// src/api.rs
//! Operational HTTP surface: health, store stats, per-scope news stack, last run.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::metrics::Metrics;
use crate::model::{CanonicalArticle, RawStats, Scope};
use crate::pipeline::{LastRun, SharedLastRun};
use crate::store::{ArticleStore, NewsStore, RawStore, StoreError};
use crate::taxonomy::ExclusionList;

const MAX_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn NewsStore>,
    pub exclusions: ExclusionList,
    pub last_run: SharedLastRun,
    pub default_limit: usize,
}

impl AppState {
    pub fn new(store: Arc<dyn NewsStore>, exclusions: ExclusionList, last_run: SharedLastRun) -> Self {
        Self {
            store,
            exclusions,
            last_run,
            default_limit: 20,
        }
    }

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit.clamp(1, MAX_LIMIT);
        self
    }
}

/// Build the ops router. `/metrics` is mounted only when a recorder is installed.
pub fn router(state: AppState, metrics: Option<&Metrics>) -> Router {
    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/stats", get(stats))
        .route("/news/{scope}", get(news_stack))
        .route("/runs/last", get(last_run))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    match metrics {
        Some(m) => app.merge(m.router()),
        None => app,
    }
}

enum ApiError {
    BadRequest(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Store(e) => {
                tracing::warn!(target: "store", error = %e, "api store failure");
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": msg }))).into_response()
    }
}

#[derive(Serialize)]
struct StatsOut {
    raw: RawStats,
    articles: u64,
}

async fn stats(State(state): State<AppState>) -> Result<Json<StatsOut>, ApiError> {
    Ok(Json(StatsOut {
        raw: state.store.raw_stats().await?,
        articles: state.store.count_articles().await?,
    }))
}

#[derive(Deserialize)]
struct NewsQuery {
    limit: Option<usize>,
}

async fn news_stack(
    State(state): State<AppState>,
    Path(scope): Path<String>,
    Query(q): Query<NewsQuery>,
) -> Result<Json<Vec<CanonicalArticle>>, ApiError> {
    let scope: Scope = scope.parse().map_err(ApiError::BadRequest)?;
    let limit = q.limit.unwrap_or(state.default_limit).clamp(1, MAX_LIMIT);
    let rows = state
        .store
        .news_stack(&scope, limit, state.exclusions.as_slice())
        .await?;
    Ok(Json(rows))
}

async fn last_run(State(state): State<AppState>) -> Json<Option<LastRun>> {
    let snapshot = state.last_run.read().ok().and_then(|g| (*g).clone());
    Json(snapshot)
}
