use crate::config::Settings;
use crate::ingest::error::{CancelReason, FetchError};
use crate::ingest::interrupt::Interrupt;
use crate::ingest::retry::{self, RetryPolicy};
use crate::storage::RatingStore;
use anyhow::Context;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_PATH: &str = "/v1/profile";
const DEFAULT_MAX_TICKERS: usize = 100;
const DEFAULT_CONCURRENCY: usize = 4;

/// Per-ticker auxiliary data (company profile, sector, logo URL, ...).
#[async_trait::async_trait]
pub trait EnrichmentSource: Send + Sync {
    async fn fetch_ticker(&self, ticker: &str, interrupt: &Interrupt)
        -> Result<Value, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpEnrichmentSource {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    path: String,
    retry: RetryPolicy,
}

impl HttpEnrichmentSource {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let base_url = settings.require_enrichment_api_base_url()?.to_string();
        let timeout_secs = crate::config::env_or("ENRICHMENT_API_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS);
        let path = std::env::var("ENRICHMENT_API_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PATH.to_string());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build enrichment http client")?;

        Ok(Self {
            http,
            base_url,
            token: settings.enrichment_api_token.clone(),
            path,
            retry: RetryPolicy::from_env(),
        })
    }

    async fn fetch_once(&self, ticker: &str) -> Result<Value, FetchError> {
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        );
        let mut req = self.http.get(url).query(&[("symbol", ticker)]);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let res = req.send().await.map_err(FetchError::from_reqwest)?;
        let status = res.status();
        let text = res.text().await.map_err(FetchError::from_reqwest)?;
        if !status.is_success() {
            return Err(FetchError::from_status(status, &text));
        }

        let value = serde_json::from_str::<Value>(&text)
            .map_err(|e| FetchError::Malformed(format!("enrichment payload: {e}")))?;
        if !value.is_object() {
            return Err(FetchError::Malformed(
                "enrichment payload is not a JSON object".to_string(),
            ));
        }
        Ok(value)
    }
}

#[async_trait::async_trait]
impl EnrichmentSource for HttpEnrichmentSource {
    async fn fetch_ticker(
        &self,
        ticker: &str,
        interrupt: &Interrupt,
    ) -> Result<Value, FetchError> {
        retry::with_backoff(self.retry, interrupt, None, "enrichment fetch", || {
            self.fetch_once(ticker)
        })
        .await
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentOptions {
    pub max_tickers: usize,
    pub concurrency: usize,
}

impl Default for EnrichmentOptions {
    fn default() -> Self {
        Self {
            max_tickers: DEFAULT_MAX_TICKERS,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl EnrichmentOptions {
    pub fn from_env() -> Self {
        Self {
            max_tickers: crate::config::env_or("ENRICH_MAX_TICKERS", DEFAULT_MAX_TICKERS),
            concurrency: crate::config::env_or("ENRICH_CONCURRENCY", DEFAULT_CONCURRENCY).max(1),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentSummary {
    pub requested: usize,
    pub enriched: Vec<String>,
    /// `(ticker, error)` pairs, sorted by ticker.
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("too many tickers: {given} given, at most {max} allowed")]
    TooManyTickers { given: usize, max: usize },

    #[error("enrichment failed for all {} tickers", .summary.requested)]
    AllFailed { summary: EnrichmentSummary },

    #[error("enrichment interrupted: {reason}")]
    Cancelled {
        reason: CancelReason,
        summary: EnrichmentSummary,
    },
}

enum TickerOutcome {
    Enriched,
    Failed(String),
    Cancelled(CancelReason),
}

/// Fetches and stores auxiliary data for each ticker independently.
pub async fn run_enrichment(
    source: &dyn EnrichmentSource,
    store: &dyn RatingStore,
    tickers: &[String],
    opts: &EnrichmentOptions,
    interrupt: &Interrupt,
) -> Result<EnrichmentSummary, EnrichmentError> {
    let mut seen = HashSet::new();
    let tickers: Vec<String> = tickers
        .iter()
        .map(|t| t.trim().to_uppercase())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect();

    if tickers.len() > opts.max_tickers {
        return Err(EnrichmentError::TooManyTickers {
            given: tickers.len(),
            max: opts.max_tickers,
        });
    }

    let mut summary = EnrichmentSummary {
        requested: tickers.len(),
        ..Default::default()
    };

    let outcomes: Vec<(String, TickerOutcome)> = stream::iter(tickers)
        .map(|ticker| async move {
            let outcome = enrich_one(source, store, &ticker, interrupt).await;
            (ticker, outcome)
        })
        .buffer_unordered(opts.concurrency.max(1))
        .collect()
        .await;

    let mut cancelled: Option<CancelReason> = None;
    for (ticker, outcome) in outcomes {
        match outcome {
            TickerOutcome::Enriched => summary.enriched.push(ticker),
            TickerOutcome::Failed(err) => {
                tracing::warn!(%ticker, error = %err, "ticker enrichment failed; continuing");
                summary.failed.push((ticker, err));
            }
            TickerOutcome::Cancelled(reason) => {
                cancelled.get_or_insert(reason);
                summary.failed.push((ticker, reason.to_string()));
            }
        }
    }
    summary.enriched.sort();
    summary.failed.sort();

    tracing::info!(
        requested = summary.requested,
        enriched = summary.enriched.len(),
        failed = summary.failed.len(),
        "enrichment finished"
    );

    if let Some(reason) = cancelled {
        return Err(EnrichmentError::Cancelled { reason, summary });
    }
    if summary.requested > 0 && summary.enriched.is_empty() {
        return Err(EnrichmentError::AllFailed { summary });
    }
    Ok(summary)
}

async fn enrich_one(
    source: &dyn EnrichmentSource,
    store: &dyn RatingStore,
    ticker: &str,
    interrupt: &Interrupt,
) -> TickerOutcome {
    let payload = match source.fetch_ticker(ticker, interrupt).await {
        Ok(v) => v,
        Err(FetchError::Cancelled(reason)) => return TickerOutcome::Cancelled(reason),
        Err(err) => return TickerOutcome::Failed(err.to_string()),
    };
    match store.create_enriched_data(ticker, &payload).await {
        Ok(()) => TickerOutcome::Enriched,
        Err(err) => TickerOutcome::Failed(format!("{err:#}")),
    }
}
