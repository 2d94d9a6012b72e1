// GitHub fetcher: pull-request search via the GraphQL API.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::config::GitHubSection;
use crate::error::FetchError;
use crate::types::{ChangeState, CommitMeta, FileChange, RemoteChange, ReviewEvent};

use super::budget::RateBudget;
use super::{SearchPage, SearchQuery, SearchSource};

/// Wait this long when the remote rejects a call without saying when to retry.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

const SEARCH_QUERY: &str = r"
query($q: String!, $first: Int!, $after: String) {
  rateLimit { remaining resetAt }
  search(query: $q, type: ISSUE, first: $first, after: $after) {
    issueCount
    pageInfo { hasNextPage endCursor }
    nodes {
      ... on PullRequest {
        id
        number
        title
        body
        state
        createdAt
        updatedAt
        mergedAt
        additions
        deletions
        headRefName
        author { login }
        reviews(first: 50) { nodes { author { login } state submittedAt } }
        files(first: 100) { nodes { path additions deletions } }
        commits(first: 50) {
          nodes { commit { oid message authoredDate author { name } } }
        }
      }
    }
  }
}";

const COUNT_QUERY: &str = r"
query($q: String!) {
  rateLimit { remaining resetAt }
  search(query: $q, type: ISSUE, first: 0) { issueCount }
}";

/// Build an HTTP client on the rustls aws-lc-rs provider.
pub fn http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    // Already installed is fine.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    Client::builder()
        .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
}

/// GitHub GraphQL search client. All instances share one [`RateBudget`].
#[derive(Debug)]
pub struct GitHubSearchFetcher {
    client: Client,
    api_url: String,
    token: Option<String>,
    budget: Arc<RateBudget>,
}

impl GitHubSearchFetcher {
    pub fn new(api_url: String, token: Option<String>, budget: Arc<RateBudget>) -> Result<Self, FetchError> {
        let client = http_client(Duration::from_secs(60))
            .map_err(|e| FetchError::TransientNetwork(e.to_string()))?;
        Ok(Self {
            client,
            api_url,
            token,
            budget,
        })
    }

    /// Build from config, reading the token from the configured env var.
    pub fn from_config(config: &GitHubSection, budget: Arc<RateBudget>) -> Result<Self, FetchError> {
        let token = std::env::var(&config.token_env).ok();
        if token.is_none() {
            warn!(env = %config.token_env, "No GitHub token set; requests will be unauthenticated");
        }
        Self::new(config.api_url.clone(), token, budget)
    }

    pub fn budget(&self) -> &Arc<RateBudget> {
        &self.budget
    }

    async fn graphql<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, FetchError> {
        let mut req = self
            .client
            .post(&self.api_url)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| FetchError::TransientNetwork(format!("GitHub API: {e}")))?;

        self.update_rate_limit(&resp);
        let status = resp.status().as_u16();

        if resp.status().is_success() {
            let body: GqlResponse<T> = resp
                .json()
                .await
                .map_err(|e| FetchError::Parse(format!("GitHub response: {e}")))?;
            return self.unwrap_graphql(body);
        }

        let limits = RateLimitHeaders::from_response(&resp);
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, body, &limits))
    }

    fn unwrap_graphql<T>(&self, body: GqlResponse<T>) -> Result<T, FetchError> {
        if let Some(err) = body.errors.iter().flatten().next() {
            if err.kind.as_deref() == Some("RATE_LIMITED") {
                let reset_at = self
                    .budget
                    .snapshot()
                    .reset_at
                    .filter(|r| *r > Utc::now())
                    .unwrap_or_else(default_reset);
                return Err(FetchError::RateLimited { reset_at });
            }
            if body.data.is_none() {
                return Err(FetchError::Api {
                    status: 200,
                    body: err.message.clone(),
                });
            }
            warn!(error = %err.message, "GitHub GraphQL returned partial data");
        }
        body.data
            .ok_or_else(|| FetchError::Parse("GitHub response has no data".to_string()))
    }

    /// Update the shared budget from response headers.
    fn update_rate_limit(&self, resp: &reqwest::Response) {
        let remaining = header_u64(resp, "x-ratelimit-remaining");
        let reset = header_u64(resp, "x-ratelimit-reset");
        if let (Some(remaining), Some(reset)) = (remaining, reset) {
            if let Some(reset_at) = epoch_to_utc(reset) {
                self.budget
                    .observe(u32::try_from(remaining).unwrap_or(u32::MAX), reset_at);
            }
        }
    }
}

#[async_trait::async_trait]
impl SearchSource for GitHubSearchFetcher {
    #[instrument(skip_all, name = "github_search", fields(filter = tracing::field::Empty))]
    async fn search(
        &self,
        query: &SearchQuery,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<SearchPage, FetchError> {
        let filter = query.filter_expression();
        tracing::Span::current().record("filter", filter.as_str());
        debug!(cursor, page_size, "GitHub search request");

        let data: GqlSearchData = self
            .graphql(
                SEARCH_QUERY,
                json!({ "q": filter, "first": page_size, "after": cursor }),
            )
            .await?;
        if let Some(limit) = &data.rate_limit {
            self.budget.observe(limit.remaining, limit.reset_at);
        }

        let mut items = Vec::with_capacity(data.search.nodes.len());
        for node in data.search.nodes {
            // Non-PR hits deserialize as empty objects.
            if node.as_object().is_some_and(serde_json::Map::is_empty) {
                continue;
            }
            let pr: GqlPullRequest = serde_json::from_value(node)
                .map_err(|e| FetchError::Parse(format!("pull request node: {e}")))?;
            items.push(pr.into_remote_change());
        }

        let page_info = data.search.page_info.unwrap_or_default();
        Ok(SearchPage {
            total_count: data.search.issue_count,
            items,
            has_more: page_info.has_next_page && page_info.end_cursor.is_some(),
            next_cursor: page_info.end_cursor,
        })
    }

    #[instrument(skip_all, name = "github_count")]
    async fn count(&self, query: &SearchQuery) -> Result<u64, FetchError> {
        let data: GqlCountData = self
            .graphql(COUNT_QUERY, json!({ "q": query.filter_expression() }))
            .await?;
        if let Some(limit) = &data.rate_limit {
            self.budget.observe(limit.remaining, limit.reset_at);
        }
        Ok(data.search.issue_count)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn header_u64(resp: &reqwest::Response, name: &str) -> Option<u64> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

fn epoch_to_utc(secs: u64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(i64::try_from(secs).ok()?, 0).single()
}

fn default_reset() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(DEFAULT_RATE_LIMIT_WAIT).unwrap_or_default()
}

/// Rate-limit signals carried by a rejected response.
#[derive(Debug, Clone, Copy, Default)]
struct RateLimitHeaders {
    /// `x-ratelimit-remaining: 0`.
    exhausted: bool,
    /// From `retry-after` (seconds), sent with secondary limits.
    retry_after: Option<DateTime<Utc>>,
    /// From `x-ratelimit-reset` (epoch). GitHub sends it on every response.
    reset_at: Option<DateTime<Utc>>,
}

impl RateLimitHeaders {
    fn from_response(resp: &reqwest::Response) -> Self {
        let retry_after = header_u64(resp, "retry-after")
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        Self {
            exhausted: header_u64(resp, "x-ratelimit-remaining") == Some(0),
            retry_after,
            reset_at: header_u64(resp, "x-ratelimit-reset").and_then(epoch_to_utc),
        }
    }

    fn resume_at(&self) -> DateTime<Utc> {
        self.retry_after
            .or(self.reset_at)
            .unwrap_or_else(default_reset)
    }
}

/// Map a non-success HTTP status onto the fetch error taxonomy.
///
/// A 403 is a rate limit only when the budget is exhausted, the server asks
/// for a retry delay, or the body names a (secondary) rate limit. Any other
/// 403 is a permission problem and fails the phase.
fn classify_status(status: u16, body: String, limits: &RateLimitHeaders) -> FetchError {
    let names_rate_limit = body.to_lowercase().contains("rate limit");
    match status {
        401 => FetchError::AuthExpired(body),
        429 => FetchError::RateLimited {
            reset_at: limits.resume_at(),
        },
        403 if limits.exhausted || limits.retry_after.is_some() || names_rate_limit => {
            FetchError::RateLimited {
                reset_at: limits.resume_at(),
            }
        }
        500..=599 => FetchError::TransientNetwork(format!("GitHub API {status}: {body}")),
        _ => FetchError::Api { status, body },
    }
}

// ── GitHub API Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GqlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GqlError>>,
}

#[derive(Debug, Deserialize)]
struct GqlError {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlRateLimit {
    remaining: u32,
    reset_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlSearchData {
    rate_limit: Option<GqlRateLimit>,
    search: GqlSearch,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlSearch {
    issue_count: u64,
    page_info: Option<GqlPageInfo>,
    #[serde(default)]
    nodes: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlCountData {
    rate_limit: Option<GqlRateLimit>,
    search: GqlCount,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlCount {
    issue_count: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlPageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GqlActor {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GqlConnection<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<T>,
}

impl<T> Default for GqlConnection<T> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlPullRequest {
    id: String,
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
    head_ref_name: Option<String>,
    author: Option<GqlActor>,
    #[serde(default)]
    reviews: GqlConnection<GqlReview>,
    #[serde(default)]
    files: GqlConnection<GqlFile>,
    #[serde(default)]
    commits: GqlConnection<GqlCommitNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlReview {
    author: Option<GqlActor>,
    state: String,
    submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GqlFile {
    path: String,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
}

#[derive(Debug, Deserialize)]
struct GqlCommitNode {
    commit: GqlCommit,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlCommit {
    oid: String,
    message: String,
    authored_date: Option<DateTime<Utc>>,
    author: Option<GqlGitActor>,
}

#[derive(Debug, Deserialize)]
struct GqlGitActor {
    name: Option<String>,
}

impl GqlPullRequest {
    fn into_remote_change(self) -> RemoteChange {
        let state = ChangeState::parse(&self.state).unwrap_or(if self.merged_at.is_some() {
            ChangeState::Merged
        } else {
            ChangeState::Open
        });

        // Pending reviews have no submission time yet.
        let reviews = self
            .reviews
            .nodes
            .into_iter()
            .filter_map(|r| {
                Some(ReviewEvent {
                    reviewer: r.author.map(|a| a.login),
                    state: r.state,
                    submitted_at: r.submitted_at?,
                })
            })
            .collect();

        let files = self
            .files
            .nodes
            .into_iter()
            .map(|f| FileChange {
                path: f.path,
                additions: f.additions,
                deletions: f.deletions,
            })
            .collect();

        let commits = self
            .commits
            .nodes
            .into_iter()
            .map(|n| CommitMeta {
                sha: n.commit.oid,
                message: n.commit.message,
                authored_at: n.commit.authored_date,
                author: n.commit.author.and_then(|a| a.name),
            })
            .collect();

        RemoteChange {
            remote_id: self.id,
            number: self.number,
            title: self.title,
            body: self.body.filter(|b| !b.is_empty()),
            author: self.author.map(|a| a.login),
            head_ref: self.head_ref_name,
            state,
            created_at: self.created_at,
            updated_at: self.updated_at,
            merged_at: self.merged_at,
            additions: self.additions,
            deletions: self.deletions,
            reviews,
            files,
            commits,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
