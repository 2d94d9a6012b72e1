// One-page-at-a-time producer over a `SearchSource`.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::SyncSection;
use crate::error::FetchError;

use super::budget::RateBudget;
use super::{SearchPage, SearchQuery, SearchSource};

/// Cooperative cancellation flag, checked before each remote call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Page size and retry policy for one pager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagerSettings {
    pub page_size: u32,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&SyncSection> for PagerSettings {
    fn from(sync: &SyncSection) -> Self {
        Self {
            page_size: sync.effective_page_size(),
            max_retries: sync.max_page_retries,
            initial_backoff: Duration::from_millis(sync.initial_backoff_ms),
            max_backoff: Duration::from_secs(sync.max_backoff_secs),
        }
    }
}

impl Default for PagerSettings {
    fn default() -> Self {
        Self::from(&SyncSection::default())
    }
}

/// Result of asking for the next page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageStep {
    Page(SearchPage),
    /// The previous page reported no more results.
    Done,
    /// Cancellation was requested before the next call.
    Cancelled,
}

/// Yields one page per call. Never buffers more than the current page.
///
/// Transient failures are retried with bounded exponential backoff. Rate
/// limits pause until the reported reset and do not count as attempts.
#[derive(Debug)]
pub struct SearchPager<'a> {
    source: &'a dyn SearchSource,
    budget: &'a RateBudget,
    query: SearchQuery,
    settings: PagerSettings,
    cancel: CancelToken,
    cursor: Option<String>,
    finished: bool,
    pages: u32,
}

impl<'a> SearchPager<'a> {
    pub fn new(
        source: &'a dyn SearchSource,
        budget: &'a RateBudget,
        query: SearchQuery,
        settings: PagerSettings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            source,
            budget,
            query,
            settings,
            cancel,
            cursor: None,
            finished: false,
            pages: 0,
        }
    }

    pub fn query(&self) -> &SearchQuery {
        &self.query
    }

    /// Pages fetched so far.
    pub fn pages(&self) -> u32 {
        self.pages
    }

    pub async fn next_page(&mut self) -> Result<PageStep, FetchError> {
        if self.finished {
            return Ok(PageStep::Done);
        }

        let source = self.source;
        let query = &self.query;
        let cursor = self.cursor.as_deref();
        let page_size = self.settings.page_size;
        let fetched = call_with_retry(self.budget, &self.settings, &self.cancel, || {
            source.search(query, cursor, page_size)
        })
        .await?;

        let Some(page) = fetched else {
            return Ok(PageStep::Cancelled);
        };

        self.pages += 1;
        debug!(
            page = self.pages,
            items = page.items.len(),
            total = page.total_count,
            has_more = page.has_more,
            "Fetched search page"
        );
        self.finished = !page.has_more || page.next_cursor.is_none();
        self.cursor.clone_from(&page.next_cursor);
        Ok(PageStep::Page(page))
    }

    /// Match count for `query`, under the same retry and pause policy.
    ///
    /// Returns `None` if cancelled.
    pub async fn count_matches(
        source: &dyn SearchSource,
        budget: &RateBudget,
        query: &SearchQuery,
        settings: &PagerSettings,
        cancel: &CancelToken,
    ) -> Result<Option<u64>, FetchError> {
        call_with_retry(budget, settings, cancel, || source.count(query)).await
    }
}

/// Run one remote call, pausing on rate limits and retrying transient errors.
///
/// Returns `Ok(None)` when cancellation is observed before a call.
async fn call_with_retry<T, F, Fut>(
    budget: &RateBudget,
    settings: &PagerSettings,
    cancel: &CancelToken,
    mut call: F,
) -> Result<Option<T>, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0u32;
    let mut delay = settings.initial_backoff;

    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        if let Some(wait) = budget.pause_needed(Utc::now()) {
            warn!(
                wait_secs = wait.as_secs(),
                remaining = ?budget.snapshot().remaining,
                "Rate limit low, pausing until reset"
            );
            tokio::time::sleep(wait).await;
            if cancel.is_cancelled() {
                return Ok(None);
            }
        }

        match call().await {
            Ok(value) => return Ok(Some(value)),
            Err(FetchError::RateLimited { reset_at }) => {
                budget.exhaust_until(reset_at);
                // A reset already in the past still gets a short breather.
                if reset_at <= Utc::now() {
                    warn!(wait_ms = delay.as_millis(), "Rate limited, backing off");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(settings.max_backoff);
                }
            }
            Err(e) if e.is_retryable() => {
                attempt += 1;
                if attempt > settings.max_retries {
                    warn!(attempt, error = %e, "Retries exhausted");
                    return Err(e);
                }
                warn!(
                    attempt,
                    wait_ms = delay.as_millis(),
                    error = %e,
                    "Transient fetch error, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(settings.max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}
