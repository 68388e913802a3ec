use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A single analyst rating event, normalized from the ratings source.
///
/// `(ticker, brokerage, rating_to, time)` is the natural key; storage enforces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub id: Uuid,
    pub ticker: String,
    pub company: String,
    pub brokerage: String,
    pub action: Action,
    pub rating_from: Option<String>,
    pub rating_to: String,
    pub target_from: Option<f64>,
    pub target_to: Option<f64>,
    pub time: DateTime<Utc>,
    /// Set by the store when the row is written; `None` before persistence.
    pub created_at: Option<DateTime<Utc>>,
}

impl Rating {
    pub fn natural_key(&self) -> NaturalKey<'_> {
        NaturalKey {
            ticker: &self.ticker,
            brokerage: &self.brokerage,
            rating_to: &self.rating_to,
            time: self.time,
        }
    }

    /// True when this rating is more recent than `other`: event time, then creation time,
    /// then id. Ratings written in one transaction share `created_at`, so the id keeps the
    /// choice independent of read order.
    pub fn is_fresher_than(&self, other: &Rating) -> bool {
        (self.time, self.created_at, self.id) > (other.time, other.created_at, other.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey<'a> {
    pub ticker: &'a str,
    pub brokerage: &'a str,
    pub rating_to: &'a str,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Upgrade,
    Downgrade,
    Initiate,
    Maintain,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Upgrade => "upgrade",
            Action::Downgrade => "downgrade",
            Action::Initiate => "initiate",
            Action::Maintain => "maintain",
        }
    }

    /// Parses an action already lowercased by the caller.
    ///
    /// The source phrases actions as "upgraded by", "maintained by", etc.; the verb's past
    /// tense and a trailing "by" are accepted and folded into the base form.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let s = s.strip_suffix(" by").unwrap_or(s).trim_end();
        match s {
            "upgrade" | "upgraded" => Some(Action::Upgrade),
            "downgrade" | "downgraded" => Some(Action::Downgrade),
            "initiate" | "initiated" => Some(Action::Initiate),
            "maintain" | "maintained" => Some(Action::Maintain),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed ordinal scale used for upgrade detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RatingGrade {
    StrongSell,
    Sell,
    Hold,
    Buy,
    StrongBuy,
}

impl RatingGrade {
    /// Maps a brokerage label onto the scale. Unknown labels map to `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        let norm = normalize_label(label);
        let grade = match norm.as_str() {
            "strong sell" => RatingGrade::StrongSell,
            "sell" | "underperform" | "underweight" | "reduce" | "sector underperform"
            | "market underperform" | "negative" => RatingGrade::Sell,
            "hold" | "neutral" | "equal weight" | "market perform" | "sector perform"
            | "in line" | "peer perform" | "sector weight" => RatingGrade::Hold,
            "buy" | "outperform" | "overweight" | "market outperform" | "sector outperform"
            | "accumulate" | "moderate buy" | "positive" => RatingGrade::Buy,
            "strong buy" | "conviction buy" | "top pick" => RatingGrade::StrongBuy,
            _ => return None,
        };
        Some(grade)
    }
}

/// Lowercases, trims and collapses `-`/`_`/repeated whitespace to single spaces.
pub fn normalize_label(label: &str) -> String {
    label
        .to_lowercase()
        .replace(['-', '_'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// True only when both labels are known and `new` strictly outranks `prior`.
pub fn is_upgrade(prior: Option<&str>, new: Option<&str>) -> bool {
    let (Some(prior), Some(new)) = (prior, new) else {
        return false;
    };
    match (RatingGrade::from_label(prior), RatingGrade::from_label(new)) {
        (Some(p), Some(n)) => n > p,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_requires_both_endpoints() {
        assert!(is_upgrade(Some("Hold"), Some("Buy")));
        assert!(is_upgrade(Some("Sell"), Some("Strong-Buy")));
        assert!(!is_upgrade(None, Some("Buy")));
        assert!(!is_upgrade(Some("Hold"), None));
        assert!(!is_upgrade(Some("Mystery"), Some("Buy")));
    }

    #[test]
    fn equal_or_lower_is_not_an_upgrade() {
        assert!(!is_upgrade(Some("Buy"), Some("Buy")));
        assert!(!is_upgrade(Some("Outperform"), Some("Buy")));
        assert!(!is_upgrade(Some("Strong Buy"), Some("Hold")));
    }

    #[test]
    fn parses_source_action_phrasing() {
        assert_eq!(Action::parse("upgraded by"), Some(Action::Upgrade));
        assert_eq!(Action::parse("maintain"), Some(Action::Maintain));
        assert_eq!(Action::parse("initiated by"), Some(Action::Initiate));
        assert_eq!(Action::parse("target raised by"), None);
    }

    #[test]
    fn freshness_breaks_ties_on_created_at() {
        let t = chrono::TimeZone::with_ymd_and_hms(&Utc, 2025, 3, 1, 12, 0, 0).unwrap();
        let base = Rating {
            id: Uuid::new_v4(),
            ticker: "AAPL".to_string(),
            company: "Apple".to_string(),
            brokerage: "X".to_string(),
            action: Action::Maintain,
            rating_from: None,
            rating_to: "Buy".to_string(),
            target_from: None,
            target_to: None,
            time: t,
            created_at: Some(t),
        };
        let mut later = base.clone();
        later.created_at = Some(t + chrono::Duration::seconds(1));
        assert!(later.is_fresher_than(&base));
        assert!(!base.is_fresher_than(&later));
    }

    #[test]
    fn same_transaction_ties_fall_back_to_id() {
        let t = chrono::TimeZone::with_ymd_and_hms(&Utc, 2025, 3, 1, 12, 0, 0).unwrap();
        let buy = Rating {
            id: Uuid::from_u128(1),
            ticker: "AAPL".to_string(),
            company: "Apple".to_string(),
            brokerage: "Alpha".to_string(),
            action: Action::Maintain,
            rating_from: None,
            rating_to: "Buy".to_string(),
            target_from: None,
            target_to: None,
            time: t,
            created_at: Some(t),
        };
        let sell = Rating {
            id: Uuid::from_u128(2),
            brokerage: "Beta".to_string(),
            rating_to: "Sell".to_string(),
            ..buy.clone()
        };
        assert!(sell.is_fresher_than(&buy));
        assert!(!buy.is_fresher_than(&sell));
    }
}
