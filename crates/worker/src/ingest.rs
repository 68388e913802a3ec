use anyhow::Context;
use ratingscope_core::config::Settings;
use ratingscope_core::ingest::enrich::{EnrichmentOptions, HttpEnrichmentSource};
use ratingscope_core::ingest::interrupt::Interrupt;
use ratingscope_core::ingest::pipeline::{run_ingestion, PipelineOptions};
use ratingscope_core::ingest::provider::HttpRatingsSource;
use ratingscope_core::service::{self, RunReport};
use ratingscope_core::storage::lock::RunKind;
use ratingscope_core::storage::memory::MemoryRatingStore;
use ratingscope_core::storage::ratings::PgRatingStore;
use serde::Serialize;

/// Fetches and validates every page into an in-memory store. No database involved.
pub async fn dry_run(settings: &Settings, interrupt: &Interrupt) -> anyhow::Result<()> {
    let source = HttpRatingsSource::from_settings(settings)?;
    let opts = PipelineOptions::from_env()?;
    let store = MemoryRatingStore::new();

    let result = run_ingestion(&source, &store, &opts, interrupt).await;
    let report = RunReport::from_ingestion(&result);
    tracing::info!(held = store.len().await, "dry run finished");
    finish(&report)
}

pub async fn run(settings: &Settings, interrupt: &Interrupt) -> anyhow::Result<()> {
    let source = HttpRatingsSource::from_settings(settings)?;
    let opts = PipelineOptions::from_env()?;
    let pool = crate::connect(settings).await?;
    let store = PgRatingStore::new(pool.clone());
    let interrupt = interrupt.clone();

    let report = service::with_run_lock(&pool, RunKind::Ingestion, async move {
        service::ingest_and_record(&source, &store, &opts, &interrupt).await
    })
    .await?;

    match report {
        Some(report) => finish(&report),
        None => Ok(()),
    }
}

pub async fn enrich(
    settings: &Settings,
    tickers: Option<Vec<String>>,
    interrupt: &Interrupt,
) -> anyhow::Result<()> {
    let source = HttpEnrichmentSource::from_settings(settings)?;
    let opts = EnrichmentOptions::from_env();
    let pool = crate::connect(settings).await?;
    let store = PgRatingStore::new(pool.clone());
    let interrupt = interrupt.clone();

    let report = service::with_run_lock(&pool, RunKind::Enrichment, async move {
        service::enrich(&source, &store, tickers, &opts, &interrupt).await
    })
    .await?;

    match report {
        Some(report) => finish(&report),
        None => Ok(()),
    }
}

fn finish<T: Serialize>(report: &RunReport<T>) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(report).context("serialize run report failed")?
    );
    anyhow::ensure!(report.succeeded(), "{}", report.message);
    Ok(())
}
