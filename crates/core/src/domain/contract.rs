use crate::domain::rating::{Action, Rating};
use crate::ingest::types::RawRating;
use chrono::{DateTime, SubsecRound, Utc};
use thiserror::Error;
use uuid::Uuid;

const MAX_TICKER_LEN: usize = 10;
/// Postgres `TIMESTAMPTZ` precision. Event times are truncated to it so every store keys on
/// the same instant.
const TIME_PRECISION_DIGITS: u16 = 6;

/// Why a raw record was excluded from persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Error)]
pub enum RejectReason {
    #[error("ticker is empty")]
    MissingTicker,
    #[error("ticker has invalid characters or length")]
    InvalidTicker,
    #[error("company is empty")]
    MissingCompany,
    #[error("brokerage is empty")]
    MissingBrokerage,
    #[error("action is not one of upgrade/downgrade/initiate/maintain")]
    InvalidAction,
    #[error("new rating label is empty")]
    MissingRatingTo,
    #[error("event time is empty")]
    MissingTime,
    #[error("event time is not a valid RFC 3339 timestamp")]
    InvalidTime,
    #[error("event time is in the future")]
    FutureTime,
    #[error("target price is not strictly positive")]
    NonPositiveTarget,
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::MissingTicker => "missing_ticker",
            RejectReason::InvalidTicker => "invalid_ticker",
            RejectReason::MissingCompany => "missing_company",
            RejectReason::MissingBrokerage => "missing_brokerage",
            RejectReason::InvalidAction => "invalid_action",
            RejectReason::MissingRatingTo => "missing_rating_to",
            RejectReason::MissingTime => "missing_time",
            RejectReason::InvalidTime => "invalid_time",
            RejectReason::FutureTime => "future_time",
            RejectReason::NonPositiveTarget => "non_positive_target",
        }
    }
}

/// Normalizes and validates a raw record. `now` is the ingestion clock.
pub fn transform(raw: &RawRating, now: DateTime<Utc>) -> Result<Rating, RejectReason> {
    let ticker = raw.ticker.trim().to_uppercase();
    if ticker.is_empty() {
        return Err(RejectReason::MissingTicker);
    }
    if ticker.len() > MAX_TICKER_LEN
        || !ticker
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        return Err(RejectReason::InvalidTicker);
    }

    let company = raw.company.trim();
    if company.is_empty() {
        return Err(RejectReason::MissingCompany);
    }

    let brokerage = raw.brokerage.trim();
    if brokerage.is_empty() {
        return Err(RejectReason::MissingBrokerage);
    }

    let action =
        Action::parse(&raw.action.trim().to_lowercase()).ok_or(RejectReason::InvalidAction)?;

    let rating_to = raw.rating_to.trim();
    if rating_to.is_empty() {
        return Err(RejectReason::MissingRatingTo);
    }

    let time = parse_time(&raw.time)?;
    if time > now {
        return Err(RejectReason::FutureTime);
    }

    let target_from = parse_price(&raw.target_from);
    let target_to = parse_price(&raw.target_to);
    for price in [target_from, target_to].into_iter().flatten() {
        if price <= 0.0 {
            return Err(RejectReason::NonPositiveTarget);
        }
    }

    let rating_from = Some(raw.rating_from.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(Rating {
        id: Uuid::new_v4(),
        ticker,
        company: company.to_string(),
        brokerage: brokerage.to_string(),
        action,
        rating_from,
        rating_to: rating_to.to_string(),
        target_from,
        target_to,
        time,
        created_at: None,
    })
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, RejectReason> {
    let t = s.trim();
    if t.is_empty() {
        return Err(RejectReason::MissingTime);
    }
    DateTime::parse_from_rfc3339(t)
        .map(|dt| dt.with_timezone(&Utc).trunc_subsecs(TIME_PRECISION_DIGITS))
        .map_err(|_| RejectReason::InvalidTime)
}

/// Parses "$4.20", "1,250.00" or "4.2". Empty or unparsable strings are absent, never zero.
pub fn parse_price(s: &str) -> Option<f64> {
    let t = s.trim();
    let t = t.strip_prefix('$').unwrap_or(t).trim();
    if t.is_empty() {
        return None;
    }
    t.replace(',', "")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}
