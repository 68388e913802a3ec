use crate::config::Settings;
use crate::ingest::circuit_breaker::{BreakerConfig, CircuitBreaker};
use crate::ingest::error::FetchError;
use crate::ingest::interrupt::Interrupt;
use crate::ingest::retry::{self, RetryPolicy};
use crate::ingest::types::RatingsPage;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PATH: &str = "/swechallenge/list";
const DEFAULT_MIN_INTERVAL_MS: u64 = 100;
const CURSOR_PARAM: &str = "next_page";

/// Paginated source of raw rating records.
#[async_trait::async_trait]
pub trait RatingsSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// Fetches the page at `cursor` (`None` for the first page). A page is returned whole or
    /// not at all.
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        interrupt: &Interrupt,
    ) -> Result<RatingsPage, FetchError>;
}

#[derive(Debug)]
pub struct HttpRatingsSource {
    http: reqwest::Client,
    base_url: String,
    token: String,
    path: String,
    retry: RetryPolicy,
    min_interval: Duration,
    last_success: tokio::sync::Mutex<Option<Instant>>,
    breaker: CircuitBreaker,
}

impl HttpRatingsSource {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_ratings_api_base_url()?.to_string();
        let token = settings.require_ratings_api_token()?.to_string();

        let timeout_secs = crate::config::env_or("RATINGS_API_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS);
        let min_interval_ms =
            crate::config::env_or("RATINGS_API_MIN_INTERVAL_MS", DEFAULT_MIN_INTERVAL_MS);

        let path = std::env::var("RATINGS_API_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PATH.to_string());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build ratings source http client")?;

        Ok(Self {
            http,
            base_url,
            token,
            path,
            retry: RetryPolicy::from_env(),
            min_interval: Duration::from_millis(min_interval_ms),
            last_success: tokio::sync::Mutex::new(None),
            breaker: CircuitBreaker::new(BreakerConfig::from_env()),
        })
    }

    fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };

        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, cursor: Option<&str>) -> reqwest::RequestBuilder {
        let mut req = self.http.get(self.url()).bearer_auth(&self.token);
        if let Some(cursor) = cursor {
            req = req.query(&[(CURSOR_PARAM, cursor)]);
        }
        req
    }

    async fn fetch_once(&self, cursor: Option<&str>) -> Result<RatingsPage, FetchError> {
        let res = self
            .request(cursor)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = res.status();
        let text = res.text().await.map_err(FetchError::from_reqwest)?;
        parse_page(status, &text)
    }

    /// Holds back until `min_interval` has passed since the last successful page.
    async fn pace(&self, interrupt: &Interrupt) -> Result<(), FetchError> {
        let last = *self.last_success.lock().await;
        if let Some(last) = last {
            let wait = self.min_interval.saturating_sub(last.elapsed());
            if !wait.is_zero() {
                interrupt.sleep(wait).await.map_err(FetchError::Cancelled)?;
            }
        }
        Ok(())
    }
}

/// Decodes a page response. The body is parsed whole: a truncated or non-JSON body yields no
/// items at all.
fn parse_page(status: reqwest::StatusCode, body: &str) -> Result<RatingsPage, FetchError> {
    if !status.is_success() {
        return Err(FetchError::from_status(status, body));
    }
    serde_json::from_str::<RatingsPage>(body)
        .map_err(|e| FetchError::Malformed(format!("ratings page: {e}")))
}

#[async_trait::async_trait]
impl RatingsSource for HttpRatingsSource {
    fn source_name(&self) -> &'static str {
        "ratings_http"
    }

    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        interrupt: &Interrupt,
    ) -> Result<RatingsPage, FetchError> {
        self.pace(interrupt).await?;

        let page = retry::with_backoff(
            self.retry,
            interrupt,
            Some(&self.breaker),
            "ratings page fetch",
            || self.fetch_once(cursor),
        )
        .await?;

        *self.last_success.lock().await = Some(Instant::now());
        tracing::debug!(
            cursor = cursor.unwrap_or(""),
            items = page.items.len(),
            has_next = page.next_cursor().is_some(),
            "fetched ratings page"
        );
        Ok(page)
    }
}
