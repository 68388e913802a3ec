use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratingscope_core::config::Settings;
use ratingscope_core::domain::recommendation::Recommendation;
use ratingscope_core::ingest::enrich::{EnrichmentOptions, EnrichmentSummary, HttpEnrichmentSource};
use ratingscope_core::ingest::interrupt::Interrupt;
use ratingscope_core::ingest::pipeline::{IngestionSummary, PipelineOptions};
use ratingscope_core::ingest::provider::HttpRatingsSource;
use ratingscope_core::recommend::RecommendationEngine;
use ratingscope_core::service::{self, RunReport, RunStatus};
use ratingscope_core::storage::lock::RunKind;
use ratingscope_core::storage::ratings::PgRatingStore;
use ratingscope_core::storage::{EnrichedData, RatingStore};

const DEFAULT_INGEST_TIMEOUT_SECS: u64 = 600;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();
    let pool: Option<PgPool> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match ratingscope_core::storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    // Built once so pacing and circuit-breaker state span runs.
    let ratings = match HttpRatingsSource::from_settings(&settings) {
        Ok(source) => Some(Arc::new(source)),
        Err(e) => {
            tracing::error!(error = %e, "ratings source not configured; ingestion disabled");
            None
        }
    };
    let enrichment = match HttpEnrichmentSource::from_settings(&settings) {
        Ok(source) => Some(Arc::new(source)),
        Err(e) => {
            tracing::error!(error = %e, "enrichment source not configured; enrichment disabled");
            None
        }
    };

    let shutdown = CancellationToken::new();
    let state = AppState {
        pool,
        ratings,
        enrichment,
        engine: RecommendationEngine::default(),
        shutdown: shutdown.clone(),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/recommendations", get(list_recommendations))
        .route("/ingestion/run", post(run_ingestion))
        .route("/enrichment/run", post(run_enrichment))
        .route("/enrichment/:ticker", get(get_enrichment))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = ratingscope_core::config::env_or("PORT", 3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Clone)]
struct AppState {
    pool: Option<PgPool>,
    ratings: Option<Arc<HttpRatingsSource>>,
    enrichment: Option<Arc<HttpEnrichmentSource>>,
    engine: RecommendationEngine,
    /// Cancelled on shutdown; in-flight runs observe a child token.
    shutdown: CancellationToken,
}

impl AppState {
    fn pool(&self) -> Result<&PgPool, StatusCode> {
        self.pool.as_ref().ok_or(StatusCode::SERVICE_UNAVAILABLE)
    }
}

fn internal(e: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&e);
    tracing::error!(error = %e, "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn report_status(status: RunStatus) -> StatusCode {
    match status {
        RunStatus::Succeeded => StatusCode::OK,
        RunStatus::Failed => StatusCode::BAD_GATEWAY,
        RunStatus::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn list_recommendations(
    State(state): State<AppState>,
) -> Result<Json<Vec<Recommendation>>, StatusCode> {
    let store = PgRatingStore::new(state.pool()?.clone());
    let recs = state
        .engine
        .generate_recommendations(&store)
        .await
        .map_err(internal)?;
    Ok(Json(recs))
}

async fn run_ingestion(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<RunReport<IngestionSummary>>), StatusCode> {
    let pool = state.pool()?.clone();
    let source = state.ratings.clone().ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    let opts = PipelineOptions::from_env().map_err(internal)?;
    let timeout = ratingscope_core::config::env_or("INGEST_TIMEOUT_SECS", DEFAULT_INGEST_TIMEOUT_SECS);
    let interrupt = Interrupt::new(state.shutdown.child_token())
        .with_timeout(Duration::from_secs(timeout));

    let store = PgRatingStore::new(pool.clone());
    let report = service::with_run_lock(&pool, RunKind::Ingestion, async move {
        service::ingest_and_record(source.as_ref(), &store, &opts, &interrupt).await
    })
    .await
    .map_err(internal)?
    .ok_or(StatusCode::CONFLICT)?;

    Ok((report_status(report.status), Json(report)))
}

#[derive(Debug, Default, Deserialize)]
struct EnrichmentRequest {
    #[serde(default)]
    tickers: Option<Vec<String>>,
}

async fn run_enrichment(
    State(state): State<AppState>,
    body: Option<Json<EnrichmentRequest>>,
) -> Result<(StatusCode, Json<RunReport<EnrichmentSummary>>), StatusCode> {
    let pool = state.pool()?.clone();
    let source = state
        .enrichment
        .clone()
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    let Json(req) = body.unwrap_or_default();
    let opts = EnrichmentOptions::from_env();

    if let Some(tickers) = &req.tickers {
        if tickers.len() > opts.max_tickers {
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    let interrupt = Interrupt::new(state.shutdown.child_token());
    let store = PgRatingStore::new(pool.clone());
    let report = service::with_run_lock(&pool, RunKind::Enrichment, async move {
        service::enrich(source.as_ref(), &store, req.tickers, &opts, &interrupt).await
    })
    .await
    .map_err(internal)?
    .ok_or(StatusCode::CONFLICT)?;

    Ok((report_status(report.status), Json(report)))
}

async fn get_enrichment(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
) -> Result<Json<EnrichedData>, StatusCode> {
    let store = PgRatingStore::new(state.pool()?.clone());
    let data = store
        .get_enriched_data(&ticker.trim().to_ascii_uppercase())
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(data))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    shutdown.cancel();
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
