//! market-news-pipeline: binary entrypoint.
//! Loads config and credentials, opens the store, and runs, schedules or
//! inspects the ingestion + categorization pipeline.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use market_news_pipeline::{
    api::{self, AppState},
    bootstrap,
    classify::build_classifier_from_env,
    cli::{Cli, Command},
    config::PipelineConfig,
    fetch_state::FetchStateTracker,
    metrics::Metrics,
    model::{FetchStateFilter, Scope},
    pipeline::{spawn_scheduler, Pipeline, SharedLastRun},
    store::{ArticleStore, NewsStore, RawStore},
};

/// `RUST_LOG` filter (default `market_news_pipeline=info,warn`); `LOG_FORMAT=json` for JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("market_news_pipeline=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

fn load_config(explicit: Option<&str>) -> anyhow::Result<PipelineConfig> {
    match explicit {
        Some(p) => PipelineConfig::load_from(&PathBuf::from(p)),
        None => PipelineConfig::load_default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;
    let store = bootstrap::open_store(cli.database_url.as_deref(), cli.memory).await?;

    match cli.command.clone() {
        Command::Stats => {
            let raw = store.raw_stats().await?;
            let articles = store.count_articles().await?;
            println!(
                "raw: total={} pending={} processing={} done={} failed={}\narticles: {}",
                raw.total, raw.pending, raw.processing, raw.done, raw.failed, articles
            );
        }
        Command::ResetState { scope, provider } => {
            let scope = scope
                .map(|s| s.parse::<Scope>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let filter = FetchStateFilter { scope, provider };
            let tracker =
                FetchStateTracker::new(store, cfg.fetch.buffer(), cfg.fetch.default_lookback());
            let removed = tracker.reset(&filter).await?;
            println!("fetch state records removed: {removed}");
        }
        Command::Run => {
            let pipeline = build_pipeline(&cli, &cfg, store)?;
            let summary = pipeline
                .run_once(chrono::Utc::now())
                .await
                .context("pipeline run")?;
            println!("{summary}");
        }
        Command::Schedule {
            interval_secs,
            serve,
        } => {
            let metrics = Metrics::init()?;
            let pipeline = Arc::new(build_pipeline(&cli, &cfg, store.clone())?);
            let last_run: SharedLastRun = Arc::new(RwLock::new(None));

            if let Some(addr) = serve.as_deref() {
                let state = AppState::new(store.clone(), cfg.report.exclusions(), last_run.clone())
                    .with_default_limit(cfg.report.news_stack_limit);
                let app = api::router(state, Some(&metrics));
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("binding ops server on {addr}"))?;
                info!(target: "pipeline", %addr, "ops server listening");
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app).await {
                        tracing::error!(target: "pipeline", error = %e, "ops server stopped");
                    }
                });
            }

            info!(target: "pipeline", interval_secs, "scheduler started");
            let handle = spawn_scheduler(
                pipeline,
                Duration::from_secs(interval_secs.max(1)),
                last_run.clone(),
            );
            tokio::select! {
                res = handle => {
                    if let Err(e) = res {
                        return Err(anyhow::anyhow!("scheduler task ended: {e}"));
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!(target: "pipeline", "shutdown requested");
                }
            }
        }
    }
    Ok(())
}

fn build_pipeline(
    cli: &Cli,
    cfg: &PipelineConfig,
    store: Arc<dyn NewsStore>,
) -> anyhow::Result<Pipeline> {
    let classifier = build_classifier_from_env(&cfg.classifier)?;
    let providers = bootstrap::build_providers(
        cfg,
        cli.finnhub_api_key.as_deref(),
        cli.polygon_api_key.as_deref(),
    )?;
    if providers.is_empty() {
        tracing::warn!(target: "pipeline", "no providers configured; runs will only drain and recategorize");
    }
    Pipeline::new(cfg, store, classifier, providers)
}
