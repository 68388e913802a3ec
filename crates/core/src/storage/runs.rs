use crate::ingest::pipeline::{IngestionError, IngestionSummary};
use anyhow::Context;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub async fn record_ingestion_run(
    pool: &sqlx::PgPool,
    started_at: DateTime<Utc>,
    source: &str,
    result: &Result<IngestionSummary, IngestionError>,
) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    let finished_at = Utc::now();

    let (status, summary, error) = match result {
        Ok(summary) => ("success", summary, None),
        Err(err @ IngestionError::Cancelled { .. }) => {
            ("cancelled", err.summary(), Some(format!("{err:#}")))
        }
        Err(err) => ("error", err.summary(), Some(format!("{err:#}"))),
    };
    let summary_json =
        serde_json::to_value(summary).context("serialize ingestion summary failed")?;

    sqlx::query(
        "INSERT INTO ingestion_runs (id, started_at, finished_at, source, status, fetched, stored, \
                                     rejected, duplicates, error, summary) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .persistent(false)
    .bind(id)
    .bind(started_at)
    .bind(finished_at)
    .bind(source)
    .bind(status)
    .bind(summary.fetched as i64)
    .bind(summary.stored as i64)
    .bind(summary.rejected as i64)
    .bind(summary.duplicates as i64)
    .bind(error)
    .bind(summary_json)
    .execute(pool)
    .await
    .context("insert ingestion_runs failed")?;

    Ok(id)
}
