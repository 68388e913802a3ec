//! Entry points shared by the worker and the API: run, audit, and render a run outcome.

use crate::ingest::enrich::{
    run_enrichment, EnrichmentError, EnrichmentOptions, EnrichmentSource, EnrichmentSummary,
};
use crate::ingest::interrupt::Interrupt;
use crate::ingest::pipeline::{run_ingestion, IngestionError, IngestionSummary, PipelineOptions};
use crate::ingest::provider::RatingsSource;
use crate::storage::lock::{RunKind, RunLock};
use crate::storage::ratings::PgRatingStore;
use crate::storage::RatingStore;
use anyhow::Context;
use serde::Serialize;
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport<T> {
    pub status: RunStatus,
    pub message: String,
    pub summary: T,
}

impl<T> RunReport<T> {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

impl RunReport<IngestionSummary> {
    pub fn from_ingestion(result: &Result<IngestionSummary, IngestionError>) -> Self {
        match result {
            Ok(summary) => Self {
                status: RunStatus::Succeeded,
                message: summary.status_line(),
                summary: summary.clone(),
            },
            Err(err) => Self {
                status: match err {
                    IngestionError::Cancelled { .. } => RunStatus::Cancelled,
                    _ => RunStatus::Failed,
                },
                message: format!("failed: {err}"),
                summary: err.summary().clone(),
            },
        }
    }
}

impl RunReport<EnrichmentSummary> {
    pub fn from_enrichment(result: &Result<EnrichmentSummary, EnrichmentError>) -> Self {
        match result {
            Ok(summary) => Self {
                status: RunStatus::Succeeded,
                message: format!(
                    "succeeded with {} enriched/{} failed",
                    summary.enriched.len(),
                    summary.failed.len()
                ),
                summary: summary.clone(),
            },
            Err(err) => {
                let (status, summary) = match err {
                    EnrichmentError::TooManyTickers { .. } => {
                        (RunStatus::Failed, EnrichmentSummary::default())
                    }
                    EnrichmentError::AllFailed { summary } => (RunStatus::Failed, summary.clone()),
                    EnrichmentError::Cancelled { summary, .. } => {
                        (RunStatus::Cancelled, summary.clone())
                    }
                };
                Self {
                    status,
                    message: format!("failed: {err}"),
                    summary,
                }
            }
        }
    }
}

/// Runs one ingestion against Postgres and records it in `ingestion_runs`.
pub async fn ingest_and_record(
    source: &dyn RatingsSource,
    store: &PgRatingStore,
    opts: &PipelineOptions,
    interrupt: &Interrupt,
) -> anyhow::Result<RunReport<IngestionSummary>> {
    let started_at = chrono::Utc::now();
    let result = run_ingestion(source, store, opts, interrupt).await;

    match &result {
        Ok(summary) => tracing::info!(
            fetched = summary.fetched,
            stored = summary.stored,
            rejected = summary.rejected,
            duplicates = summary.duplicates,
            "ingestion run finished"
        ),
        Err(err) => tracing::error!(error = %err, "ingestion run failed"),
    }

    let run_id = crate::storage::runs::record_ingestion_run(
        store.pool(),
        started_at,
        source.source_name(),
        &result,
    )
    .await?;
    tracing::debug!(%run_id, "ingestion run recorded");

    Ok(RunReport::from_ingestion(&result))
}

/// Enriches `tickers`, or every known ticker (up to the configured bound) when none are given.
pub async fn enrich(
    source: &dyn EnrichmentSource,
    store: &dyn RatingStore,
    tickers: Option<Vec<String>>,
    opts: &EnrichmentOptions,
    interrupt: &Interrupt,
) -> anyhow::Result<RunReport<EnrichmentSummary>> {
    let tickers = match tickers {
        Some(t) => t,
        None => store
            .list_unique_tickers()
            .await?
            .into_iter()
            .take(opts.max_tickers)
            .collect(),
    };
    let result = run_enrichment(source, store, &tickers, opts, interrupt).await;
    if let Err(err) = &result {
        tracing::error!(error = %err, "enrichment run failed");
    }
    Ok(RunReport::from_enrichment(&result))
}

/// Drives `work` on its own task, so dropping the caller (a disconnected HTTP client, say)
/// does not abandon it halfway through.
pub async fn run_detached<T, F>(work: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work).await.context("run task aborted")?
}

/// Runs `work` under the `kind` run lock. Returns `Ok(None)` when another run holds it.
///
/// The lock travels with the detached task and is released there once `work` finishes.
pub async fn with_run_lock<T, F>(
    pool: &sqlx::PgPool,
    kind: RunKind,
    work: F,
) -> anyhow::Result<Option<T>>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let Some(lock) = RunLock::try_acquire(pool, kind).await? else {
        tracing::warn!(?kind, "run lock not acquired; another run in progress");
        return Ok(None);
    };

    run_detached(async move {
        let out = work.await;
        let kind = lock.kind();
        if let Err(err) = lock.release().await {
            tracing::warn!(?kind, error = %err, "failed to release run lock");
        }
        out
    })
    .await
    .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::error::CancelReason;

    #[test]
    fn zero_fetched_run_is_reported_as_success() {
        let report = RunReport::from_ingestion(&Ok(IngestionSummary::default()));
        assert!(report.succeeded());
        assert_eq!(report.message, "succeeded with 0 rejected/0 duplicates");
    }

    #[test]
    fn failures_keep_partial_counts() {
        let summary = IngestionSummary {
            fetched: 9,
            stored: 4,
            ..Default::default()
        };
        let report = RunReport::from_ingestion(&Err(IngestionError::Cancelled {
            reason: CancelReason::DeadlineExceeded,
            summary,
        }));
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.summary.stored, 4);
        assert!(report.message.starts_with("failed: "));
    }

    #[tokio::test(start_paused = true)]
    async fn detached_run_finishes_after_caller_is_dropped() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::time::Duration;

        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let caller = run_detached(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        // The caller gives up after one second and is dropped.
        assert!(tokio::time::timeout(Duration::from_secs(1), caller)
            .await
            .is_err());
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn detached_run_propagates_errors() {
        let out: anyhow::Result<()> = run_detached(async { anyhow::bail!("upstream down") }).await;
        assert_eq!(out.unwrap_err().to_string(), "upstream down");
    }

    #[test]
    fn serializes_status_lowercase() {
        let report = RunReport::from_ingestion(&Ok(IngestionSummary::default()));
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["status"], "succeeded");
        assert_eq!(v["summary"]["fetched"], 0);
    }
}
