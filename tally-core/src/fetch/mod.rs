//! Remote search: date-bounded, cursor-paginated pull-request queries.

pub mod budget;
pub mod github;
pub mod pager;

use chrono::{DateTime, Duration, Utc};

use crate::error::{FetchError, IntegrityError};
use crate::types::RemoteChange;

pub use budget::{BudgetSnapshot, RateBudget};
pub use github::GitHubSearchFetcher;
pub use pager::{CancelToken, PageStep, PagerSettings, SearchPager};

/// Inclusive-exclusive UTC range: `from <= created_at < to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at < self.to
    }

    /// Split into consecutive sub-windows of at most `chunk_days`, oldest first.
    ///
    /// `0` disables sharding. The chunks tile the window exactly, with no
    /// gaps or overlaps.
    pub fn split(&self, chunk_days: u32) -> Vec<Self> {
        if self.is_empty() {
            return Vec::new();
        }
        if chunk_days == 0 {
            return vec![*self];
        }

        let step = Duration::days(i64::from(chunk_days));
        let mut chunks = Vec::new();
        let mut from = self.from;
        while from < self.to {
            let to = (from + step).min(self.to);
            chunks.push(Self { from, to });
            from = to;
        }
        chunks
    }

    /// Split at the midpoint, on a whole second. `None` once the window is
    /// too narrow to split, since filter bounds have one-second resolution.
    pub fn halve(&self) -> Option<(Self, Self)> {
        let secs = (self.to - self.from).num_seconds();
        if secs < 2 {
            return None;
        }
        let mid = self.from + Duration::seconds(secs / 2);
        Some((
            Self {
                from: self.from,
                to: mid,
            },
            Self { from: mid, to: self.to },
        ))
    }
}

/// A search filter for one resource and one date window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub owner: String,
    pub name: String,
    pub window: DateWindow,
}

impl SearchQuery {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, window: DateWindow) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            window,
        }
    }

    /// Search-syntax filter encoding the resource and the date bounds.
    pub fn filter_expression(&self) -> String {
        const FMT: &str = "%Y-%m-%dT%H:%M:%SZ";
        format!(
            "repo:{}/{} is:pr created:>={} created:<{} sort:created-asc",
            self.owner,
            self.name,
            self.window.from.format(FMT),
            self.window.to.format(FMT),
        )
    }
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    /// Exact match count for the filter, independent of the cursor.
    pub total_count: u64,
    pub items: Vec<RemoteChange>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// The remote search API boundary.
#[async_trait::async_trait]
pub trait SearchSource: Send + Sync + std::fmt::Debug {
    /// Fetch one page of up to `page_size` items after `cursor`.
    async fn search(
        &self,
        query: &SearchQuery,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<SearchPage, FetchError>;

    /// Match count only, without items.
    async fn count(&self, query: &SearchQuery) -> Result<u64, FetchError>;
}

/// Reject records whose timestamps contradict each other.
pub fn validate_change(change: &RemoteChange) -> Result<(), IntegrityError> {
    if change.merged_at.is_some_and(|m| m < change.created_at) {
        return Err(IntegrityError::MergedBeforeCreated {
            remote_id: change.remote_id.clone(),
        });
    }
    if change
        .reviews
        .iter()
        .any(|r| r.submitted_at < change.created_at)
    {
        return Err(IntegrityError::ReviewBeforeCreated {
            remote_id: change.remote_id.clone(),
        });
    }
    Ok(())
}

/// Parse "owner/name" (or a GitHub URL, SSH or HTTPS) into its parts.
pub fn parse_resource_slug(input: &str) -> Option<(String, String)> {
    let input = input.trim();
    let rest = if let Some(rest) = input.strip_prefix("git@github.com:") {
        rest
    } else if let Some((_, after)) = input.split_once("github.com/") {
        after
    } else {
        input
    };
    let rest = rest.strip_suffix(".git").unwrap_or(rest);
    let rest = rest.trim_end_matches('/');
    let (owner, name) = rest.split_once('/')?;
    if owner.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((owner.to_string(), name.to_string()))
}
