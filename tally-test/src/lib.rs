// Integration test utilities and fixtures for Tally.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use tally_core::config::TallyConfig;
use tally_core::enrich::{InferenceOutput, InferenceProvider, InferenceRequest};
use tally_core::error::{EnrichError, FetchError};
use tally_core::fetch::{RateBudget, SearchPage, SearchQuery, SearchSource};
use tally_core::pipeline::TallyPipeline;
use tally_core::store::SyncStore;
use tally_core::store::sqlite::SqliteStore;
use tally_core::sync::{WorkQueue, WorkerPool};
use tally_core::types::{
    ChangeRecordId, ChangeState, Classification, FileChange, RemoteChange, ResourceId,
    ReviewEvent, TeamId, TrackedResource,
};

/// A file-backed store with one team tracking `acme/api`.
#[derive(Debug)]
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub store: Arc<SqliteStore>,
    pub team: TeamId,
    pub resource: ResourceId,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let store = Arc::new(SqliteStore::open(&dir.path().join("tally.db")).expect("open store"));
        let team = store.ensure_team("platform").await.expect("create team");
        let resource = store
            .track_resource(team, "acme", "api")
            .await
            .expect("track resource");
        Self {
            dir,
            store,
            team,
            resource,
        }
    }

    /// Defaults with millisecond backoffs so retries don't slow tests down.
    pub fn config() -> TallyConfig {
        let mut config = TallyConfig::default();
        config.sync.initial_backoff_ms = 1;
        config.sync.max_backoff_secs = 1;
        config.sync.workers = 2;
        config.enrichment.initial_backoff_ms = 1;
        config
    }

    pub async fn resource(&self) -> TrackedResource {
        self.store
            .get_resource(self.resource)
            .await
            .expect("read resource")
            .expect("resource exists")
    }

    /// Build a pipeline over this store and start its workers.
    pub fn start_pipeline(
        &self,
        source: Arc<FakeSearchSource>,
        inference: Option<Arc<FakeInferenceProvider>>,
        config: &TallyConfig,
    ) -> (Arc<TallyPipeline>, WorkerPool) {
        let (queue, receiver) = WorkQueue::new();
        let pipeline = Arc::new(TallyPipeline::new(
            self.store.clone(),
            source,
            Arc::new(RateBudget::new(config.github.rate_limit_pause_threshold)),
            inference.map(|p| p as Arc<dyn InferenceProvider>),
            config,
            queue,
        ));
        let pool = pipeline.start(&receiver, config.sync.workers);
        (pipeline, pool)
    }
}

/// Block until the pipeline's queue drains, including chained follow-ups.
pub async fn run_until_idle(pipeline: &TallyPipeline) {
    tokio::time::timeout(Duration::from_secs(30), pipeline.queue().wait_idle())
        .await
        .expect("pipeline did not go idle");
}

// ── Remote search fake ─────────────────────────────────────────────

/// Serves a fixed item list filtered by each query's window, paged by offset cursors.
///
/// Optionally snapshots the tracked resource's counters before every search
/// call, so tests can check what a status poll would have seen mid-phase.
#[derive(Default)]
pub struct FakeSearchSource {
    items: Vec<RemoteChange>,
    fail_after: Mutex<Option<u32>>,
    searches: AtomicU32,
    counts: AtomicU32,
    observer: Mutex<Option<(Arc<dyn SyncStore>, ResourceId)>>,
    observations: Mutex<Vec<(u64, Option<u64>)>>,
}

impl std::fmt::Debug for FakeSearchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeSearchSource")
            .field("items", &self.items.len())
            .field("searches", &self.searches)
            .finish_non_exhaustive()
    }
}

impl FakeSearchSource {
    pub fn new(items: Vec<RemoteChange>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    /// Every search call after the first `n` fails with an expired token.
    pub fn fail_searches_after(&self, n: u32) {
        *self.fail_after.lock().unwrap() = Some(n);
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        *self.fail_after.lock().unwrap() = None;
    }

    pub fn observe(&self, store: Arc<dyn SyncStore>, id: ResourceId) {
        *self.observer.lock().unwrap() = Some((store, id));
    }

    /// `(completed_items, total_items)` as seen before each search call.
    pub fn observations(&self) -> Vec<(u64, Option<u64>)> {
        self.observations.lock().unwrap().clone()
    }

    pub fn search_calls(&self) -> u32 {
        self.searches.load(Ordering::SeqCst)
    }

    pub fn count_calls(&self) -> u32 {
        self.counts.load(Ordering::SeqCst)
    }

    fn matching(&self, query: &SearchQuery) -> Vec<&RemoteChange> {
        self.items
            .iter()
            .filter(|c| query.window.contains(c.created_at))
            .collect()
    }
}

#[async_trait::async_trait]
impl SearchSource for FakeSearchSource {
    async fn search(
        &self,
        query: &SearchQuery,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<SearchPage, FetchError> {
        let call = self.searches.fetch_add(1, Ordering::SeqCst) + 1;

        let observer = self.observer.lock().unwrap().clone();
        if let Some((store, id)) = observer {
            if let Ok(Some(resource)) = store.get_resource(id).await {
                self.observations
                    .lock()
                    .unwrap()
                    .push((resource.completed_items, resource.total_items));
            }
        }

        let fail_after = *self.fail_after.lock().unwrap();
        if fail_after.is_some_and(|n| call > n) {
            return Err(FetchError::AuthExpired("token revoked".into()));
        }

        let all = self.matching(query);
        let offset: usize = cursor.map_or(0, |c| c.parse().expect("offset cursor"));
        let end = (offset + page_size as usize).min(all.len());
        let has_more = end < all.len();
        Ok(SearchPage {
            total_count: all.len() as u64,
            items: all[offset..end].iter().map(|c| (*c).clone()).collect(),
            next_cursor: has_more.then(|| end.to_string()),
            has_more,
        })
    }

    async fn count(&self, query: &SearchQuery) -> Result<u64, FetchError> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        Ok(self.matching(query).len() as u64)
    }
}

// ── Inference fake ─────────────────────────────────────────────────

/// Classifies by keyword: summaries mentioning "copilot" are AI-assisted.
#[derive(Debug, Default)]
pub struct FakeInferenceProvider {
    /// Answer only the first N records of each batch.
    answer_limit: Option<usize>,
    unavailable: AtomicBool,
    calls: AtomicU32,
    submitted: Mutex<Vec<ChangeRecordId>>,
}

impl FakeInferenceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider that drops everything past the first `n` records of a batch,
    /// as if the sweep died partway through writing results.
    pub fn answering_first(n: usize) -> Self {
        Self {
            answer_limit: Some(n),
            ..Self::default()
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every record id ever submitted, in submission order.
    pub fn submitted(&self) -> Vec<ChangeRecordId> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl InferenceProvider for FakeInferenceProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn classify(&self, batch: &[InferenceRequest]) -> Result<InferenceOutput, EnrichError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EnrichError::ProviderUnavailable("fake outage".into()));
        }
        self.submitted
            .lock()
            .unwrap()
            .extend(batch.iter().map(|r| r.id));

        let answered = self.answer_limit.unwrap_or(batch.len()).min(batch.len());
        let classifications = batch[..answered]
            .iter()
            .map(|request| {
                let ai = request.summary.to_lowercase().contains("copilot");
                let classification = Classification {
                    is_ai_assisted: ai,
                    tools: if ai {
                        ["copilot".to_string()].into()
                    } else {
                        Default::default()
                    },
                    confidence: Some(0.9),
                    categories: ["backend".to_string()].into(),
                };
                (request.id, classification)
            })
            .collect();
        Ok(InferenceOutput {
            classifications,
            ..InferenceOutput::default()
        })
    }
}

// ── Record builders ────────────────────────────────────────────────

/// An open PR with a few lines and one touched file.
pub fn change(i: u64, created_at: DateTime<Utc>) -> RemoteChange {
    RemoteChange {
        remote_id: format!("PR_{i}"),
        number: i,
        title: format!("Change {i}"),
        body: None,
        author: Some("alice".into()),
        head_ref: Some(format!("feature/{i}")),
        state: ChangeState::Open,
        created_at,
        updated_at: None,
        merged_at: None,
        additions: 10,
        deletions: 2,
        reviews: Vec::new(),
        files: vec![FileChange {
            path: format!("src/module_{}.rs", i % 5),
            additions: 10,
            deletions: 2,
        }],
        commits: Vec::new(),
    }
}

/// A PR reviewed after one hour and merged after `hours_to_merge`.
pub fn merged_change(i: u64, created_at: DateTime<Utc>, hours_to_merge: i64) -> RemoteChange {
    let mut c = change(i, created_at);
    c.state = ChangeState::Merged;
    c.merged_at = Some(created_at + chrono::Duration::hours(hours_to_merge));
    c.reviews.push(ReviewEvent {
        reviewer: Some("bob".into()),
        state: "APPROVED".into(),
        submitted_at: created_at + chrono::Duration::hours(1),
    });
    c
}

/// `n` PRs numbered from `first`, created `step` apart starting at `from`.
pub fn spread(first: u64, n: u64, from: DateTime<Utc>, step: chrono::Duration) -> Vec<RemoteChange> {
    (0..n)
        .map(|k| {
            let at = from + step * i32::try_from(k).expect("small fixture");
            change(first + k, at)
        })
        .collect()
}

/// Parse an RFC 3339 timestamp.
pub fn at(s: &str) -> DateTime<Utc> {
    s.parse().expect("valid timestamp")
}
