use crate::domain::rating::{Action, Rating};
use crate::storage::{CreateOutcome, EnrichedData, RatingStore, SubBatchOutcome};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

type RatingRow = (
    Uuid,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<f64>,
    Option<f64>,
    DateTime<Utc>,
    DateTime<Utc>,
);

#[derive(Debug, Clone)]
pub struct PgRatingStore {
    pool: sqlx::PgPool,
}

impl PgRatingStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

async fn create_rating(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    rating: &Rating,
) -> anyhow::Result<CreateOutcome> {
    let res = sqlx::query(
        "INSERT INTO ratings (id, ticker, company, brokerage, action, rating_from, rating_to, \
                              target_from, target_to, time) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         ON CONFLICT ON CONSTRAINT ratings_natural_key DO NOTHING",
    )
    .persistent(false)
    .bind(rating.id)
    .bind(&rating.ticker)
    .bind(&rating.company)
    .bind(&rating.brokerage)
    .bind(rating.action.as_str())
    .bind(&rating.rating_from)
    .bind(&rating.rating_to)
    .bind(rating.target_from)
    .bind(rating.target_to)
    .bind(rating.time)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("insert ratings failed (ticker={})", rating.ticker))?;

    Ok(if res.rows_affected() == 0 {
        CreateOutcome::Duplicate
    } else {
        CreateOutcome::Created
    })
}

fn row_to_rating(row: RatingRow) -> anyhow::Result<Rating> {
    let (
        id,
        ticker,
        company,
        brokerage,
        action,
        rating_from,
        rating_to,
        target_from,
        target_to,
        time,
        created_at,
    ) = row;
    let action = Action::parse(&action)
        .with_context(|| format!("invalid action in DB for rating id={id}: {action}"))?;
    Ok(Rating {
        id,
        ticker,
        company,
        brokerage,
        action,
        rating_from,
        rating_to,
        target_from,
        target_to,
        time,
        created_at: Some(created_at),
    })
}

#[async_trait::async_trait]
impl RatingStore for PgRatingStore {
    async fn persist_sub_batch(&self, ratings: &[Rating]) -> anyhow::Result<SubBatchOutcome> {
        let t0 = std::time::Instant::now();
        let mut tx = self.pool.begin().await.context("begin transaction failed")?;

        let mut outcome = SubBatchOutcome::default();
        for rating in ratings {
            // Dropping `tx` on error rolls the sub-batch back.
            outcome.record(create_rating(&mut tx, rating).await?);
        }

        tx.commit().await.context("commit transaction failed")?;

        tracing::debug!(
            batch_size = ratings.len(),
            stored = outcome.stored,
            duplicates = outcome.duplicates,
            elapsed_ms = t0.elapsed().as_millis(),
            "ratings sub-batch persisted"
        );
        Ok(outcome)
    }

    async fn latest_rating_per_ticker(&self) -> anyhow::Result<BTreeMap<String, Rating>> {
        let rows = sqlx::query_as::<_, RatingRow>(
            "SELECT DISTINCT ON (ticker) \
                    id, ticker, company, brokerage, action, rating_from, rating_to, \
                    target_from, target_to, time, created_at \
             FROM ratings \
             ORDER BY ticker ASC, time DESC, created_at DESC, id DESC",
        )
        .persistent(false)
        .fetch_all(&self.pool)
        .await
        .context("select latest ratings failed")?;

        let mut out = BTreeMap::new();
        for row in rows {
            let rating = row_to_rating(row)?;
            out.insert(rating.ticker.clone(), rating);
        }
        Ok(out)
    }

    async fn list_unique_tickers(&self) -> anyhow::Result<BTreeSet<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT ticker FROM ratings ORDER BY ticker ASC")
                .persistent(false)
                .fetch_all(&self.pool)
                .await
                .context("select distinct tickers failed")?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    async fn create_enriched_data(&self, ticker: &str, payload: &Value) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO enriched_data (ticker, payload, fetched_at) \
             VALUES ($1, $2, now()) \
             ON CONFLICT (ticker) DO UPDATE \
               SET payload = EXCLUDED.payload, fetched_at = EXCLUDED.fetched_at",
        )
        .persistent(false)
        .bind(ticker)
        .bind(payload)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert enriched_data failed (ticker={ticker})"))?;
        Ok(())
    }

    async fn get_enriched_data(&self, ticker: &str) -> anyhow::Result<Option<EnrichedData>> {
        let row = sqlx::query_as::<_, (String, Value, DateTime<Utc>)>(
            "SELECT ticker, payload, fetched_at FROM enriched_data WHERE ticker = $1",
        )
        .persistent(false)
        .bind(ticker)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("select enriched_data failed (ticker={ticker})"))?;

        Ok(row.map(|(ticker, payload, fetched_at)| EnrichedData {
            ticker,
            payload,
            fetched_at,
        }))
    }
}
