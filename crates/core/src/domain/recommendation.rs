use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Derived buy-side candidate. Recomputed on demand, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub ticker: String,
    pub company: String,
    pub score: f64,
    pub rationale: String,
    pub rating: String,
    pub target_price: Option<f64>,
    pub technical: Option<TechnicalSignal>,
    pub sentiment_score: Option<f64>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendClass {
    /// Rising beyond the threshold ("golden cross").
    Rising,
    /// Falling beyond the threshold ("death cross").
    Falling,
    Neutral,
    InsufficientData,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TechnicalSignal {
    pub class: TrendClass,
    pub score: f64,
}

/// Optional per-ticker inputs used to attach technical/sentiment signals.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SignalInputs {
    /// Closing prices, oldest first.
    #[serde(default)]
    pub closes: Vec<f64>,
    /// Sentiment in [-1, 1].
    #[serde(default)]
    pub sentiment: Option<f64>,
}
