pub mod lock;
pub mod memory;
pub mod ratings;
pub mod runs;

use crate::domain::rating::Rating;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A rating with the same natural key already exists.
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubBatchOutcome {
    pub stored: usize,
    pub duplicates: usize,
}

impl SubBatchOutcome {
    pub fn record(&mut self, outcome: CreateOutcome) {
        match outcome {
            CreateOutcome::Created => self.stored += 1,
            CreateOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedData {
    pub ticker: String,
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
}

/// Persistence capability consumed by the pipeline and the recommendation engine.
#[async_trait::async_trait]
pub trait RatingStore: Send + Sync {
    /// Creates each rating individually inside one transaction. Natural-key conflicts count
    /// as duplicates; any other error rolls the whole sub-batch back.
    async fn persist_sub_batch(&self, ratings: &[Rating]) -> anyhow::Result<SubBatchOutcome>;

    async fn latest_rating_per_ticker(&self) -> anyhow::Result<BTreeMap<String, Rating>>;

    async fn list_unique_tickers(&self) -> anyhow::Result<BTreeSet<String>>;

    async fn create_enriched_data(&self, ticker: &str, payload: &Value) -> anyhow::Result<()>;

    async fn get_enriched_data(&self, ticker: &str) -> anyhow::Result<Option<EnrichedData>>;
}

/// Latest rating per ticker: newest event time, ties broken by newest creation time.
pub fn latest_per_ticker<I>(ratings: I) -> BTreeMap<String, Rating>
where
    I: IntoIterator<Item = Rating>,
{
    let mut out: BTreeMap<String, Rating> = BTreeMap::new();
    for rating in ratings {
        match out.get(&rating.ticker) {
            Some(current) if !rating.is_fresher_than(current) => {}
            _ => {
                out.insert(rating.ticker.clone(), rating);
            }
        }
    }
    out
}
