use crate::domain::recommendation::{SignalInputs, TechnicalSignal, TrendClass};
use anyhow::Context;
use std::collections::BTreeMap;
use std::path::Path;

/// Relative move between first and last close that counts as a trend.
pub const TREND_THRESHOLD: f64 = 0.02;

const RISING_SCORE: f64 = 0.8;
const FALLING_SCORE: f64 = 0.2;
const NEUTRAL_SCORE: f64 = 0.5;
const INSUFFICIENT_SCORE: f64 = 0.0;

/// Classifies the short-term trend of `closes` (oldest first) from its endpoints.
pub fn classify_trend(closes: &[f64]) -> TechnicalSignal {
    let endpoints = match (closes.first(), closes.last()) {
        (Some(&first), Some(&last)) if closes.len() >= 2 => Some((first, last)),
        _ => None,
    };
    let Some((first, last)) = endpoints.filter(|(f, l)| *f > 0.0 && f.is_finite() && l.is_finite())
    else {
        return TechnicalSignal {
            class: TrendClass::InsufficientData,
            score: INSUFFICIENT_SCORE,
        };
    };

    let change = (last - first) / first;
    let (class, score) = if change > TREND_THRESHOLD {
        (TrendClass::Rising, RISING_SCORE)
    } else if change < -TREND_THRESHOLD {
        (TrendClass::Falling, FALLING_SCORE)
    } else {
        (TrendClass::Neutral, NEUTRAL_SCORE)
    };
    TechnicalSignal { class, score }
}

/// Rescales a sentiment in [-1, 1] to [0, 1]. No sentiment means no score.
pub fn sentiment_score(sentiment: Option<f64>) -> Option<f64> {
    sentiment
        .filter(|s| s.is_finite())
        .map(|s| (s.clamp(-1.0, 1.0) + 1.0) / 2.0)
}

/// Parses a JSON object of `ticker -> {closes, sentiment}`. Tickers are uppercased to match
/// stored ratings.
pub fn parse_signal_inputs(json: &str) -> anyhow::Result<BTreeMap<String, SignalInputs>> {
    let raw: BTreeMap<String, SignalInputs> =
        serde_json::from_str(json).context("signal inputs must be a JSON object keyed by ticker")?;
    Ok(raw
        .into_iter()
        .map(|(ticker, inputs)| (ticker.trim().to_uppercase(), inputs))
        .collect())
}

pub fn load_signal_inputs(path: &Path) -> anyhow::Result<BTreeMap<String, SignalInputs>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("read signal inputs failed ({})", path.display()))?;
    parse_signal_inputs(&json)
}
