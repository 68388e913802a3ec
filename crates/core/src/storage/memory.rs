use crate::domain::rating::Rating;
use crate::storage::{
    latest_per_ticker, CreateOutcome, EnrichedData, RatingStore, SubBatchOutcome,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};

type OwnedKey = (String, String, String, DateTime<Utc>);

#[derive(Debug, Default)]
struct State {
    ratings: Vec<Rating>,
    keys: HashSet<OwnedKey>,
    enriched: BTreeMap<String, EnrichedData>,
}

/// Process-local store with the same natural-key and sub-batch semantics as Postgres.
#[derive(Debug, Default)]
pub struct MemoryRatingStore {
    state: tokio::sync::Mutex<State>,
}

fn owned_key(rating: &Rating) -> OwnedKey {
    let k = rating.natural_key();
    (
        k.ticker.to_string(),
        k.brokerage.to_string(),
        k.rating_to.to_string(),
        k.time,
    )
}

impl MemoryRatingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.ratings.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl RatingStore for MemoryRatingStore {
    async fn persist_sub_batch(&self, ratings: &[Rating]) -> anyhow::Result<SubBatchOutcome> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let mut staged_keys = HashSet::new();
        let mut staged = Vec::new();
        let mut outcome = SubBatchOutcome::default();
        for rating in ratings {
            let key = owned_key(rating);
            if state.keys.contains(&key) || !staged_keys.insert(key) {
                outcome.record(CreateOutcome::Duplicate);
                continue;
            }
            let mut row = rating.clone();
            row.created_at = Some(now);
            staged.push(row);
            outcome.record(CreateOutcome::Created);
        }

        state.keys.extend(staged_keys);
        state.ratings.extend(staged);
        Ok(outcome)
    }

    async fn latest_rating_per_ticker(&self) -> anyhow::Result<BTreeMap<String, Rating>> {
        let state = self.state.lock().await;
        Ok(latest_per_ticker(state.ratings.iter().cloned()))
    }

    async fn list_unique_tickers(&self) -> anyhow::Result<BTreeSet<String>> {
        let state = self.state.lock().await;
        Ok(state.ratings.iter().map(|r| r.ticker.clone()).collect())
    }

    async fn create_enriched_data(&self, ticker: &str, payload: &Value) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.enriched.insert(
            ticker.to_string(),
            EnrichedData {
                ticker: ticker.to_string(),
                payload: payload.clone(),
                fetched_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_enriched_data(&self, ticker: &str) -> anyhow::Result<Option<EnrichedData>> {
        Ok(self.state.lock().await.enriched.get(ticker).cloned())
    }
}
