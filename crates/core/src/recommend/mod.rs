//! Buy-side recommendations derived from the latest rating per ticker.
//!
//! The rule set is deterministic: filter positive candidates, score them from a fixed label
//! bonus table, drop those at or below the acceptance threshold, sort by score.

pub mod signals;

use crate::domain::rating::{is_upgrade, normalize_label, Action, Rating};
use crate::domain::recommendation::{Recommendation, SignalInputs};
use crate::storage::RatingStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct LabelBonuses {
    pub strong_buy: f64,
    pub buy: f64,
    /// Outperform / overweight class labels.
    pub outperform: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationConfig {
    pub base_score: f64,
    /// Candidates must score strictly above this.
    pub acceptance_threshold: f64,
    pub bonuses: LabelBonuses,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            base_score: 0.7,
            acceptance_threshold: 0.6,
            bonuses: LabelBonuses {
                strong_buy: 0.2,
                buy: 0.1,
                outperform: 0.05,
            },
        }
    }
}

impl RecommendationConfig {
    pub fn label_bonus(&self, label: &str) -> f64 {
        let norm = normalize_label(label);
        if norm.contains("strong buy") {
            self.bonuses.strong_buy
        } else if norm.contains("buy") {
            self.bonuses.buy
        } else if is_outperform_class(&norm) {
            self.bonuses.outperform
        } else {
            0.0
        }
    }

    /// Base plus label bonus, clamped to [0, 1].
    pub fn score(&self, rating: &Rating) -> f64 {
        (self.base_score + self.label_bonus(&rating.rating_to)).clamp(0.0, 1.0)
    }
}

fn is_outperform_class(norm: &str) -> bool {
    norm.contains("outperform") || norm.contains("overweight")
}

/// A rating is a candidate when its new label is positive, or it is an upgrade confirmed by
/// the ordinal scale.
pub fn is_positive_candidate(rating: &Rating) -> bool {
    let norm = normalize_label(&rating.rating_to);
    if norm.contains("buy") || is_outperform_class(&norm) {
        return true;
    }
    rating.action == Action::Upgrade
        && is_upgrade(rating.rating_from.as_deref(), Some(&rating.rating_to))
}

fn rationale(rating: &Rating) -> String {
    match (rating.action, rating.rating_from.as_deref()) {
        (Action::Upgrade, Some(from)) => format!(
            "Upgraded from {from} to {} by {}",
            rating.rating_to, rating.brokerage
        ),
        (Action::Upgrade, None) => {
            format!("Upgraded to {} by {}", rating.rating_to, rating.brokerage)
        }
        (Action::Initiate, _) => format!(
            "Coverage initiated at {} by {}",
            rating.rating_to, rating.brokerage
        ),
        _ => format!("{} rating from {}", rating.rating_to, rating.brokerage),
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecommendationEngine {
    config: RecommendationConfig,
}

impl RecommendationEngine {
    pub fn new(config: RecommendationConfig) -> Self {
        Self { config }
    }

    pub async fn generate_recommendations(
        &self,
        store: &dyn RatingStore,
    ) -> anyhow::Result<Vec<Recommendation>> {
        self.generate_with_signals(store, &BTreeMap::new()).await
    }

    pub async fn generate_with_signals(
        &self,
        store: &dyn RatingStore,
        signals: &BTreeMap<String, SignalInputs>,
    ) -> anyhow::Result<Vec<Recommendation>> {
        let latest = store.latest_rating_per_ticker().await?;
        let out = self.derive(&latest, signals, Utc::now());
        tracing::info!(
            tickers = latest.len(),
            recommendations = out.len(),
            "recommendations generated"
        );
        Ok(out)
    }

    /// Pure derivation over an already-resolved latest-rating map.
    pub fn derive(
        &self,
        latest: &BTreeMap<String, Rating>,
        signals: &BTreeMap<String, SignalInputs>,
        generated_at: DateTime<Utc>,
    ) -> Vec<Recommendation> {
        let mut out: Vec<Recommendation> = latest
            .values()
            .filter(|r| is_positive_candidate(r))
            .map(|r| (r, self.config.score(r)))
            .filter(|(_, score)| *score > self.config.acceptance_threshold)
            .map(|(r, score)| {
                let inputs = signals.get(&r.ticker);
                Recommendation {
                    ticker: r.ticker.clone(),
                    company: r.company.clone(),
                    score,
                    rationale: rationale(r),
                    rating: r.rating_to.clone(),
                    target_price: r.target_to,
                    technical: inputs.map(|i| signals::classify_trend(&i.closes)),
                    sentiment_score: inputs.and_then(|i| signals::sentiment_score(i.sentiment)),
                    generated_at,
                }
            })
            .collect();

        // Stable: equal scores keep ticker order.
        out.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::recommendation::TrendClass;
    use crate::storage::memory::MemoryRatingStore;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn rating(ticker: &str, action: Action, from: Option<&str>, to: &str) -> Rating {
        Rating {
            id: Uuid::new_v4(),
            ticker: ticker.to_string(),
            company: format!("{ticker} Inc."),
            brokerage: "Broker".to_string(),
            action,
            rating_from: from.map(str::to_string),
            rating_to: to.to_string(),
            target_from: None,
            target_to: Some(200.0),
            time: Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
            created_at: None,
        }
    }

    fn latest(ratings: Vec<Rating>) -> BTreeMap<String, Rating> {
        ratings.into_iter().map(|r| (r.ticker.clone(), r)).collect()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 2, 0, 0, 0).unwrap()
    }

    #[test]
    fn buy_upgrade_is_recommended_hold_is_not() {
        let engine = RecommendationEngine::default();
        let out = engine.derive(
            &latest(vec![
                rating("AAPL", Action::Upgrade, Some("Hold"), "Buy"),
                rating("GOOGL", Action::Maintain, Some("Hold"), "Hold"),
            ]),
            &BTreeMap::new(),
            at(),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ticker, "AAPL");
        assert!(out[0].score > 0.6);
        assert_eq!(out[0].rating, "Buy");
        assert_eq!(out[0].target_price, Some(200.0));
        assert_eq!(out[0].generated_at, at());
    }

    #[test]
    fn scores_follow_the_bonus_table() {
        let cfg = RecommendationConfig::default();
        let strong = rating("A", Action::Maintain, None, "Strong Buy");
        let unknown = rating("B", Action::Maintain, None, "Unknown");
        let outperform = rating("C", Action::Maintain, None, "Market Outperform");
        assert!((cfg.score(&strong) - 0.9).abs() < 1e-9);
        assert!((cfg.score(&unknown) - 0.7).abs() < 1e-9);
        assert!((cfg.score(&outperform) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn upgrade_action_needs_scale_confirmation() {
        // Neither label is positive, so the upgrade must be confirmed on the scale.
        assert!(is_positive_candidate(&rating(
            "A",
            Action::Upgrade,
            Some("Sell"),
            "Neutral"
        )));
        assert!(!is_positive_candidate(&rating(
            "B",
            Action::Upgrade,
            None,
            "Neutral"
        )));
        assert!(!is_positive_candidate(&rating(
            "C",
            Action::Upgrade,
            Some("Hold"),
            "Neutral"
        )));
    }

    #[test]
    fn threshold_is_exclusive() {
        let engine = RecommendationEngine::new(RecommendationConfig {
            acceptance_threshold: 0.8,
            ..Default::default()
        });
        let out = engine.derive(
            &latest(vec![
                rating("AAA", Action::Maintain, None, "Buy"),
                rating("BBB", Action::Maintain, None, "Strong Buy"),
            ]),
            &BTreeMap::new(),
            at(),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ticker, "BBB");
    }

    #[test]
    fn sorted_by_score_with_stable_ties() {
        let engine = RecommendationEngine::default();
        let out = engine.derive(
            &latest(vec![
                rating("ZZZ", Action::Maintain, None, "Buy"),
                rating("MMM", Action::Maintain, None, "Strong Buy"),
                rating("AAA", Action::Maintain, None, "Buy"),
                rating("OOO", Action::Maintain, None, "Overweight"),
            ]),
            &BTreeMap::new(),
            at(),
        );
        let tickers: Vec<_> = out.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["MMM", "AAA", "ZZZ", "OOO"]);
    }

    #[test]
    fn attaches_signals_without_changing_score() {
        let engine = RecommendationEngine::default();
        let mut signals = BTreeMap::new();
        signals.insert(
            "AAPL".to_string(),
            SignalInputs {
                closes: vec![100.0, 105.0],
                sentiment: Some(0.5),
            },
        );
        let out = engine.derive(
            &latest(vec![rating("AAPL", Action::Maintain, None, "Buy")]),
            &signals,
            at(),
        );
        let tech = out[0].technical.unwrap();
        assert_eq!(tech.class, TrendClass::Rising);
        assert_eq!(out[0].sentiment_score, Some(0.75));
        assert!((out[0].score - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn signals_from_a_file_reach_stored_recommendations() {
        let store = MemoryRatingStore::new();
        store
            .persist_sub_batch(&[rating("AAPL", Action::Maintain, None, "Buy")])
            .await
            .unwrap();
        let signals =
            signals::parse_signal_inputs(r#"{"aapl": {"closes": [100.0, 90.0]}}"#).unwrap();

        let out = RecommendationEngine::default()
            .generate_with_signals(&store, &signals)
            .await
            .unwrap();
        assert_eq!(out[0].technical.unwrap().class, TrendClass::Falling);
        assert_eq!(out[0].sentiment_score, None);
    }

    #[tokio::test]
    async fn reads_latest_rating_from_store() {
        let store = MemoryRatingStore::new();
        let mut old = rating("AAPL", Action::Maintain, None, "Strong Buy");
        old.time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let newer = rating("AAPL", Action::Downgrade, Some("Buy"), "Hold");
        store.persist_sub_batch(&[old, newer]).await.unwrap();

        let out = RecommendationEngine::default()
            .generate_recommendations(&store)
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
