use crate::domain::contract::{transform, RejectReason};
use crate::domain::rating::Rating;
use crate::ingest::error::{CancelReason, FetchError};
use crate::ingest::interrupt::Interrupt;
use crate::ingest::provider::RatingsSource;
use crate::storage::RatingStore;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_SUB_BATCH_SIZE: usize = 100;
const DEFAULT_PAGE_DELAY_MS: u64 = 250;
const DEFAULT_PERSIST_CONCURRENCY: usize = 2;
const MAX_LOGGED_REJECTIONS: usize = 10;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub sub_batch_size: usize,
    /// Pause between successive pages.
    pub page_delay: Duration,
    /// Sub-batches of one page persisted concurrently.
    pub persist_concurrency: usize,
    /// Safety cap on pages per run.
    pub max_pages: Option<usize>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            sub_batch_size: DEFAULT_SUB_BATCH_SIZE,
            page_delay: Duration::from_millis(DEFAULT_PAGE_DELAY_MS),
            persist_concurrency: DEFAULT_PERSIST_CONCURRENCY,
            max_pages: None,
        }
    }
}

impl PipelineOptions {
    pub fn from_env() -> anyhow::Result<Self> {
        let out = Self {
            sub_batch_size: crate::config::env_or("INGEST_SUB_BATCH_SIZE", DEFAULT_SUB_BATCH_SIZE),
            page_delay: Duration::from_millis(crate::config::env_or(
                "INGEST_PAGE_DELAY_MS",
                DEFAULT_PAGE_DELAY_MS,
            )),
            persist_concurrency: crate::config::env_or(
                "INGEST_PERSIST_CONCURRENCY",
                DEFAULT_PERSIST_CONCURRENCY,
            ),
            max_pages: crate::config::env_opt("INGEST_MAX_PAGES"),
        };
        anyhow::ensure!(out.sub_batch_size >= 1, "INGEST_SUB_BATCH_SIZE must be >= 1");
        anyhow::ensure!(
            out.persist_concurrency >= 1,
            "INGEST_PERSIST_CONCURRENCY must be >= 1"
        );
        Ok(out)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionSummary {
    pub pages: usize,
    pub fetched: usize,
    pub stored: usize,
    pub rejected: usize,
    pub duplicates: usize,
    /// Rejection counts keyed by reason code.
    pub rejections: BTreeMap<&'static str, usize>,
    pub sub_batches: usize,
    pub failed_sub_batches: usize,
    /// Non-fatal errors, in the order they occurred.
    pub errors: Vec<String>,
}

impl IngestionSummary {
    fn record_rejection(&mut self, reason: RejectReason) {
        self.rejected += 1;
        *self.rejections.entry(reason.code()).or_default() += 1;
    }

    pub fn status_line(&self) -> String {
        format!(
            "succeeded with {} rejected/{} duplicates",
            self.rejected, self.duplicates
        )
    }
}

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("page fetch failed after {} pages: {source}", .summary.pages)]
    Fetch {
        #[source]
        source: FetchError,
        summary: IngestionSummary,
    },

    #[error("all {} sub-batches failed to persist", .summary.sub_batches)]
    Persistence { summary: IngestionSummary },

    #[error("ingestion interrupted: {reason}")]
    Cancelled {
        reason: CancelReason,
        summary: IngestionSummary,
    },
}

impl IngestionError {
    pub fn summary(&self) -> &IngestionSummary {
        match self {
            IngestionError::Fetch { summary, .. }
            | IngestionError::Persistence { summary }
            | IngestionError::Cancelled { summary, .. } => summary,
        }
    }
}

/// Walks the ratings source from the first page to the end, persisting every valid record.
///
/// Each run starts from the first page; duplicates from earlier runs are absorbed by the
/// natural key.
pub async fn run_ingestion(
    source: &dyn RatingsSource,
    store: &dyn RatingStore,
    opts: &PipelineOptions,
    interrupt: &Interrupt,
) -> Result<IngestionSummary, IngestionError> {
    let mut summary = IngestionSummary::default();
    let mut cursor: Option<String> = None;
    let mut logged_rejections: usize = 0;

    loop {
        if let Some(max) = opts.max_pages {
            if summary.pages >= max {
                tracing::warn!(max_pages = max, "page cap reached; stopping ingestion early");
                summary
                    .errors
                    .push(format!("stopped at page cap ({max}) before end of data"));
                break;
            }
        }

        let page = match source.fetch_page(cursor.as_deref(), interrupt).await {
            Ok(page) => page,
            Err(FetchError::Cancelled(reason)) => {
                return Err(IngestionError::Cancelled { reason, summary });
            }
            Err(err) => {
                summary
                    .errors
                    .push(format!("page {} fetch: {err}", summary.pages + 1));
                return Err(IngestionError::Fetch {
                    source: err,
                    summary,
                });
            }
        };

        if page.items.is_empty() {
            break;
        }

        summary.pages += 1;
        summary.fetched += page.items.len();

        let now = Utc::now();
        let mut batch: Vec<Rating> = Vec::with_capacity(page.items.len());
        for raw in &page.items {
            match transform(raw, now) {
                Ok(rating) => batch.push(rating),
                Err(reason) => {
                    if logged_rejections < MAX_LOGGED_REJECTIONS {
                        tracing::warn!(
                            ticker = %raw.ticker,
                            brokerage = %raw.brokerage,
                            reason = reason.code(),
                            "rating rejected"
                        );
                        logged_rejections += 1;
                    }
                    summary.record_rejection(reason);
                }
            }
        }

        persist_batch(store, &batch, opts, summary.pages, &mut summary).await;

        tracing::info!(
            page = summary.pages,
            fetched = summary.fetched,
            stored = summary.stored,
            rejected = summary.rejected,
            duplicates = summary.duplicates,
            failed_sub_batches = summary.failed_sub_batches,
            "ingestion progress"
        );

        let Some(next) = page.next_cursor() else {
            break;
        };
        if cursor.as_deref() == Some(next) {
            let err = FetchError::Malformed(format!("cursor did not advance ({next})"));
            summary.errors.push(err.to_string());
            return Err(IngestionError::Fetch {
                source: err,
                summary,
            });
        }
        cursor = Some(next.to_string());

        if let Err(reason) = interrupt.sleep(opts.page_delay).await {
            return Err(IngestionError::Cancelled { reason, summary });
        }
    }

    if summary.sub_batches > 0 && summary.failed_sub_batches == summary.sub_batches {
        return Err(IngestionError::Persistence { summary });
    }

    Ok(summary)
}

/// Splits a page's valid ratings into sub-batches; a failing sub-batch is rolled back by the
/// store and recorded without stopping the rest.
async fn persist_batch(
    store: &dyn RatingStore,
    batch: &[Rating],
    opts: &PipelineOptions,
    page: usize,
    summary: &mut IngestionSummary,
) {
    if batch.is_empty() {
        return;
    }

    let size = opts.sub_batch_size.max(1);
    // Futures are built eagerly (they are lazy until polled) so the stream type
    // carries no higher-ranked closure, which trips the `Send` check upstream.
    let futs: Vec<_> = batch
        .chunks(size)
        .enumerate()
        .map(|(idx, chunk)| async move { (idx, chunk.len(), store.persist_sub_batch(chunk).await) })
        .collect();
    let mut results = stream::iter(futs)
        .buffered(opts.persist_concurrency.max(1));

    // Results are folded here, in sub-batch order, by a single consumer.
    while let Some((idx, len, res)) = results.next().await {
        summary.sub_batches += 1;
        match res {
            Ok(outcome) => {
                summary.stored += outcome.stored;
                summary.duplicates += outcome.duplicates;
            }
            Err(err) => {
                summary.failed_sub_batches += 1;
                tracing::warn!(
                    page,
                    sub_batch = idx + 1,
                    batch_size = len,
                    error = %err,
                    "sub-batch rolled back; continuing"
                );
                summary
                    .errors
                    .push(format!("page {page} sub-batch {}: {err:#}", idx + 1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rating::Rating;
    use crate::ingest::types::{RatingsPage, RawRating};
    use crate::storage::memory::MemoryRatingStore;
    use crate::storage::{EnrichedData, SubBatchOutcome};
    use crate::ingest::circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker};
    use crate::ingest::retry::{self, RetryPolicy};
    use serde_json::{json, Value};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays a fixed list of page responses, restarting from the top on each run.
    struct ScriptedSource {
        pages: Vec<Result<RatingsPage, u16>>,
        cursor_log: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Result<RatingsPage, u16>>) -> Self {
            Self {
                pages,
                cursor_log: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl RatingsSource for ScriptedSource {
        fn source_name(&self) -> &'static str {
            "scripted"
        }

        async fn fetch_page(
            &self,
            cursor: Option<&str>,
            _interrupt: &Interrupt,
        ) -> Result<RatingsPage, FetchError> {
            self.cursor_log
                .lock()
                .unwrap()
                .push(cursor.map(str::to_string));
            let idx = match cursor {
                None => 0,
                Some(c) => c.trim_start_matches("p").parse::<usize>().unwrap(),
            };
            match &self.pages[idx] {
                Ok(page) => Ok(page.clone()),
                Err(status) => Err(FetchError::RetriesExhausted {
                    attempts: 4,
                    last: Box::new(FetchError::Transient {
                        status: Some(*status),
                        message: "upstream down".to_string(),
                    }),
                }),
            }
        }
    }

    /// Fails every sub-batch that contains one of the listed tickers.
    struct FaultyStore {
        inner: MemoryRatingStore,
        poison: BTreeSet<String>,
    }

    #[async_trait::async_trait]
    impl RatingStore for FaultyStore {
        async fn persist_sub_batch(&self, ratings: &[Rating]) -> anyhow::Result<SubBatchOutcome> {
            if ratings.iter().any(|r| self.poison.contains(&r.ticker)) {
                anyhow::bail!("connection reset while inserting ratings");
            }
            self.inner.persist_sub_batch(ratings).await
        }

        async fn latest_rating_per_ticker(&self) -> anyhow::Result<BTreeMap<String, Rating>> {
            self.inner.latest_rating_per_ticker().await
        }

        async fn list_unique_tickers(&self) -> anyhow::Result<BTreeSet<String>> {
            self.inner.list_unique_tickers().await
        }

        async fn create_enriched_data(&self, ticker: &str, payload: &Value) -> anyhow::Result<()> {
            self.inner.create_enriched_data(ticker, payload).await
        }

        async fn get_enriched_data(&self, ticker: &str) -> anyhow::Result<Option<EnrichedData>> {
            self.inner.get_enriched_data(ticker).await
        }
    }

    fn raw(ticker: &str, brokerage: &str) -> RawRating {
        serde_json::from_value(json!({
            "ticker": ticker,
            "company": format!("{ticker} Inc."),
            "brokerage": brokerage,
            "action": "upgraded by",
            "rating_from": "Hold",
            "rating_to": "Buy",
            "target_from": "$10.00",
            "target_to": "$12.50",
            "time": "2025-01-13T00:30:05Z"
        }))
        .unwrap()
    }

    fn page(items: Vec<RawRating>, next: Option<&str>) -> RatingsPage {
        RatingsPage {
            items,
            next_page: next.map(str::to_string),
        }
    }

    fn opts() -> PipelineOptions {
        PipelineOptions {
            sub_batch_size: 2,
            page_delay: Duration::from_millis(10),
            persist_concurrency: 2,
            max_pages: None,
        }
    }

    fn two_page_source() -> ScriptedSource {
        let mut invalid = raw("MSFT", "Broker");
        invalid.time.clear();
        ScriptedSource::new(vec![
            Ok(page(
                vec![
                    raw("AAPL", "A"),
                    raw("MSFT", "A"),
                    raw("GOOG", "A"),
                    raw("AMZN", "A"),
                    raw("NVDA", "A"),
                    invalid,
                ],
                Some("p1"),
            )),
            Ok(page(
                vec![raw("AAPL", "B"), raw("MSFT", "B"), raw("TSLA", "B")],
                None,
            )),
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn two_page_run_then_rerun_is_idempotent() {
        let source = two_page_source();
        let store = MemoryRatingStore::new();

        let first = run_ingestion(&source, &store, &opts(), &Interrupt::never())
            .await
            .unwrap();
        assert_eq!(first.pages, 2);
        assert_eq!(first.fetched, 9);
        assert_eq!(first.stored, 8);
        assert_eq!(first.rejected, 1);
        assert_eq!(first.duplicates, 0);
        assert_eq!(first.rejections.get("missing_time"), Some(&1));
        assert_eq!(first.status_line(), "succeeded with 1 rejected/0 duplicates");

        let second = run_ingestion(&source, &store, &opts(), &Interrupt::never())
            .await
            .unwrap();
        assert_eq!(second.fetched, 9);
        assert_eq!(second.stored, 0);
        assert_eq!(second.duplicates, 8);
        assert_eq!(store.len().await, 8);

        // Both runs start from the first page.
        let log = source.cursor_log.lock().unwrap().clone();
        assert_eq!(log, vec![None, Some("p1".to_string()), None, Some("p1".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn same_natural_key_with_distinct_ids_survives_once() {
        let source = ScriptedSource::new(vec![Ok(page(
            vec![raw("AAPL", "A"), raw("AAPL", "A"), raw("AAPL", "A")],
            None,
        ))]);
        let store = MemoryRatingStore::new();
        let summary = run_ingestion(&source, &store, &opts(), &Interrupt::never())
            .await
            .unwrap();
        assert_eq!(summary.stored, 1);
        assert_eq!(summary.duplicates, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_source_is_a_success() {
        let source = ScriptedSource::new(vec![Ok(page(vec![], Some("p1")))]);
        let store = MemoryRatingStore::new();
        let summary = run_ingestion(&source, &store, &opts(), &Interrupt::never())
            .await
            .unwrap();
        assert_eq!(summary.fetched, 0);
        assert_eq!(summary.pages, 0);
        assert!(summary.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_is_fatal_but_keeps_partial_counts() {
        let source = ScriptedSource::new(vec![
            Ok(page(vec![raw("AAPL", "A"), raw("MSFT", "A")], Some("p1"))),
            Err(503),
        ]);
        let store = MemoryRatingStore::new();
        let err = run_ingestion(&source, &store, &opts(), &Interrupt::never())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Fetch { .. }));
        assert_eq!(err.summary().stored, 2);
        assert_eq!(err.summary().errors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_sub_batch_does_not_abort_the_run() {
        let store = FaultyStore {
            inner: MemoryRatingStore::new(),
            poison: ["GOOG".to_string()].into_iter().collect(),
        };
        let summary = run_ingestion(&two_page_source(), &store, &opts(), &Interrupt::never())
            .await
            .unwrap();

        // Page 1 sub-batches: [AAPL, MSFT], [GOOG, AMZN] (rolled back), [NVDA].
        assert_eq!(summary.sub_batches, 5);
        assert_eq!(summary.failed_sub_batches, 1);
        assert_eq!(summary.stored, 6);
        assert_eq!(store.inner.len().await, 6);
        assert!(summary.errors[0].contains("sub-batch 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn every_sub_batch_failing_is_a_run_failure() {
        let store = FaultyStore {
            inner: MemoryRatingStore::new(),
            poison: ["AAPL", "MSFT", "GOOG", "AMZN", "NVDA", "TSLA"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        };
        let err = run_ingestion(&two_page_source(), &store, &opts(), &Interrupt::never())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Persistence { .. }));
        assert_eq!(err.summary().failed_sub_batches, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_page_delay_reports_partial_counts() {
        let source = two_page_source();
        let store = MemoryRatingStore::new();
        let interrupt = Interrupt::never();
        let token = interrupt.token().clone();
        let mut options = opts();
        options.page_delay = Duration::from_secs(60);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let err = run_ingestion(&source, &store, &options, &interrupt)
            .await
            .unwrap_err();
        let IngestionError::Cancelled { reason, summary } = err else {
            panic!("expected cancellation");
        };
        assert_eq!(reason, CancelReason::Requested);
        assert_eq!(summary.pages, 1);
        assert_eq!(summary.stored, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_cleanly() {
        let source = two_page_source();
        let store = MemoryRatingStore::new();
        let interrupt = Interrupt::never().with_timeout(Duration::from_secs(5));
        let mut options = opts();
        options.page_delay = Duration::from_secs(30);

        let err = run_ingestion(&source, &store, &options, &interrupt)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestionError::Cancelled {
                reason: CancelReason::DeadlineExceeded,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_cursor_is_detected() {
        let source = ScriptedSource::new(vec![
            Ok(page(vec![raw("AAPL", "A")], Some("p1"))),
            Ok(page(vec![raw("MSFT", "A")], Some("p1"))),
        ]);
        let store = MemoryRatingStore::new();
        let err = run_ingestion(&source, &store, &opts(), &Interrupt::never())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestionError::Fetch {
                source: FetchError::Malformed(_),
                ..
            }
        ));
        assert_eq!(err.summary().stored, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn page_cap_stops_early() {
        let source = two_page_source();
        let store = MemoryRatingStore::new();
        let mut options = opts();
        options.max_pages = Some(1);
        let summary = run_ingestion(&source, &store, &options, &Interrupt::never())
            .await
            .unwrap();
        assert_eq!(summary.pages, 1);
        assert_eq!(summary.errors.len(), 1);
    }

    /// Upstream that always answers 503, guarded by a breaker that outlives each run.
    struct DownSource {
        breaker: CircuitBreaker,
        attempts: AtomicU32,
    }

    #[async_trait::async_trait]
    impl RatingsSource for DownSource {
        fn source_name(&self) -> &'static str {
            "down"
        }

        async fn fetch_page(
            &self,
            _cursor: Option<&str>,
            interrupt: &Interrupt,
        ) -> Result<RatingsPage, FetchError> {
            retry::with_backoff(
                RetryPolicy::default(),
                interrupt,
                Some(&self.breaker),
                "ratings page fetch",
                || async {
                    self.attempts.fetch_add(1, Ordering::SeqCst);
                    Err(FetchError::Transient {
                        status: Some(503),
                        message: "unavailable".to_string(),
                    })
                },
            )
            .await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_state_carries_over_between_runs() {
        let source = DownSource {
            breaker: CircuitBreaker::new(BreakerConfig::default()),
            attempts: AtomicU32::new(0),
        };
        let store = MemoryRatingStore::new();

        let first = run_ingestion(&source, &store, &opts(), &Interrupt::never())
            .await
            .unwrap_err();
        assert!(matches!(
            first,
            IngestionError::Fetch {
                source: FetchError::RetriesExhausted { .. },
                ..
            }
        ));
        assert_eq!(source.breaker.state(), BreakerState::Closed);

        let second = run_ingestion(&source, &store, &opts(), &Interrupt::never())
            .await
            .unwrap_err();
        assert!(matches!(
            second,
            IngestionError::Fetch {
                source: FetchError::CircuitOpen { .. },
                ..
            }
        ));
        assert!(matches!(source.breaker.state(), BreakerState::Open { .. }));
        assert_eq!(source.attempts.load(Ordering::SeqCst), 5);
    }
}
