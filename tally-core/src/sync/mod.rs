//! Two-phase sync orchestration.
//!
//! A resource moves `not_started -> quick -> deep -> complete`. Each phase
//! run pages through the remote search for its date window, upserts
//! records, and bumps the persisted counters. A fatal error parks the
//! resource in `failed` with the phase to re-enter; a new trigger resumes
//! that phase.

pub mod lock;
pub mod queue;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};

use crate::config::SyncSection;
use crate::enrich::pattern::PatternDetector;
use crate::error::{StoreError, TallyError};
use crate::fetch::{
    DateWindow, PageStep, PagerSettings, RateBudget, SearchPage, SearchPager, SearchQuery,
    SearchSource, validate_change,
};
use crate::progress::{ProgressTracker, SyncStatus};
use crate::store::SyncStore;
use crate::types::{ResourceId, SyncPhase, TrackedResource};

pub use lock::{CancelRegistry, ResourceLocks};
pub use queue::{Job, JobHandler, JobReceiver, WorkQueue, WorkerPool};

/// How a phase run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// All pages persisted; the resource moved to `next`.
    Completed {
        next: SyncPhase,
        fetched: u64,
        skipped: u64,
    },
    /// Stopped between pages on request. State is left for a later resume.
    Cancelled,
    /// Another run holds the resource.
    Busy,
    /// The resource is no longer in the phase this job was queued for.
    Stale { current: SyncPhase },
    /// The phase was marked failed with this error.
    Failed { error: String },
}

/// Per-run page tallies.
#[derive(Debug, Default, Clone, Copy)]
struct RunStats {
    fetched: u64,
    skipped: u64,
}

enum RunEnd {
    Finished(RunStats),
    Cancelled,
}

/// One filter window of a phase, with its match count if already known.
#[derive(Debug, Clone, Copy)]
struct Shard {
    window: DateWindow,
    counted: Option<u64>,
}

/// Quick phase: `[anchor - quick, anchor)`. Deep phase: `[anchor - lookback, anchor - quick)`.
///
/// Both phases share the anchor (the run's start time) so their windows tile
/// without overlap, even when deep resumes much later.
pub fn phase_window(
    phase: SyncPhase,
    anchor: DateTime<Utc>,
    quick_days: u32,
    lookback_days: u32,
) -> Option<DateWindow> {
    let quick_start = anchor - Duration::days(i64::from(quick_days));
    match phase {
        SyncPhase::Quick => Some(DateWindow::new(quick_start, anchor)),
        SyncPhase::Deep => {
            let deep_start = anchor - Duration::days(i64::from(lookback_days));
            Some(DateWindow::new(deep_start.min(quick_start), quick_start))
        }
        _ => None,
    }
}

/// Coordinates phase runs for every tracked resource.
pub struct SyncOrchestrator {
    store: Arc<dyn SyncStore>,
    source: Arc<dyn SearchSource>,
    budget: Arc<RateBudget>,
    queue: WorkQueue,
    locks: ResourceLocks,
    cancels: CancelRegistry,
    detector: PatternDetector,
    config: SyncSection,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("source", &self.source)
            .field("budget", &self.budget)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn SyncStore>,
        source: Arc<dyn SearchSource>,
        budget: Arc<RateBudget>,
        queue: WorkQueue,
        config: SyncSection,
    ) -> Self {
        Self {
            store,
            source,
            budget,
            queue,
            locks: ResourceLocks::new(),
            cancels: CancelRegistry::new(),
            detector: PatternDetector::new(),
            config,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Inbound trigger. Puts the resource into a runnable phase and enqueues
    /// the run; returns without waiting for it.
    ///
    /// - fresh or completed: a new run enters `quick`, with the lookback
    ///   override persisted for both phases
    /// - failed: the failed phase is re-entered with the original window
    /// - mid-phase with no active run (interrupted): that phase is re-queued
    /// - mid-phase with an active run: nothing changes
    #[instrument(skip_all, name = "start_sync", fields(resource = %id))]
    pub async fn start_sync(
        &self,
        id: ResourceId,
        lookback_days: Option<u32>,
    ) -> crate::error::Result<SyncStatus> {
        let resource = self.require_resource(id).await?;
        if !resource.active {
            return Err(StoreError::NotFound(format!("resource {id} is inactive")).into());
        }

        let phase = match resource.sync_phase {
            SyncPhase::NotStarted | SyncPhase::Complete => {
                let run_id = uuid::Uuid::new_v4().to_string();
                self.store.request_sync(id, lookback_days, &run_id).await?;
                info!(resource = %resource.slug(), run_id, lookback_days, "Sync requested");
                SyncPhase::Quick
            }
            SyncPhase::Failed => {
                let phase = resource
                    .active_phase
                    .filter(|p| p.is_runnable())
                    .unwrap_or(SyncPhase::Quick);
                if lookback_days.is_some() {
                    debug!("Lookback override ignored when resuming a failed phase");
                }
                self.store.begin_phase(id, phase).await?;
                info!(resource = %resource.slug(), %phase, "Resuming failed phase");
                phase
            }
            phase @ (SyncPhase::Quick | SyncPhase::Deep) => {
                if self.locks.is_busy(id) {
                    debug!(%phase, "Run already active");
                    return self.status(id).await;
                }
                info!(resource = %resource.slug(), %phase, "Re-queuing interrupted phase");
                phase
            }
        };

        self.queue.push(Job::RunPhase {
            resource_id: id,
            phase,
        });
        self.status(id).await
    }

    /// Request cancellation of the resource's active run, honored between pages.
    pub fn cancel(&self, id: ResourceId) -> bool {
        let cancelled = self.cancels.cancel(id);
        if cancelled {
            info!(resource = %id, "Sync cancellation requested");
        }
        cancelled
    }

    pub async fn status(&self, id: ResourceId) -> crate::error::Result<SyncStatus> {
        ProgressTracker::new(Arc::clone(&self.store))
            .get_status(id)
            .await
    }

    /// Execute one phase for one resource under its lock.
    #[instrument(skip_all, name = "run_phase", fields(resource = %id, phase = %phase))]
    pub async fn run_phase(
        &self,
        id: ResourceId,
        phase: SyncPhase,
    ) -> crate::error::Result<PhaseOutcome> {
        let Some(guard) = self.locks.try_acquire(id) else {
            debug!("Resource busy, skipping duplicate run");
            return Ok(PhaseOutcome::Busy);
        };

        let resource = self.require_resource(id).await?;
        if resource.sync_phase != phase || !phase.is_runnable() {
            debug!(current = %resource.sync_phase, "Stale phase job");
            return Ok(PhaseOutcome::Stale {
                current: resource.sync_phase,
            });
        }

        let cancel = self.cancels.begin(id);
        self.store.begin_phase(id, phase).await?;
        info!(resource = %resource.slug(), "Phase started");

        let result = self.fetch_phase(&resource, phase, &cancel).await;
        self.cancels.finish(id);

        match result {
            Ok(RunEnd::Finished(stats)) => {
                let next = phase.next().unwrap_or(SyncPhase::Complete);
                if !self.store.advance_phase(id, phase, next).await? {
                    let current = self.require_resource(id).await?.sync_phase;
                    warn!(%current, "Phase changed underneath run");
                    return Ok(PhaseOutcome::Stale { current });
                }
                info!(
                    resource = %resource.slug(),
                    next = %next,
                    fetched = stats.fetched,
                    skipped = stats.skipped,
                    "Phase complete"
                );
                // The follow-up job must find the lock free.
                drop(guard);
                self.schedule_follow_ups(&resource, next);
                Ok(PhaseOutcome::Completed {
                    next,
                    fetched: stats.fetched,
                    skipped: stats.skipped,
                })
            }
            Ok(RunEnd::Cancelled) => {
                info!(resource = %resource.slug(), "Phase cancelled between pages");
                Ok(PhaseOutcome::Cancelled)
            }
            Err(e) => {
                let error = e.to_string();
                warn!(resource = %resource.slug(), error = %error, "Phase failed");
                self.store.mark_failed(id, phase, &error).await?;
                Ok(PhaseOutcome::Failed { error })
            }
        }
    }

    /// Phase completion chains the next phase, enrichment, and aggregation.
    fn schedule_follow_ups(&self, resource: &TrackedResource, next: SyncPhase) {
        if next.is_runnable() {
            self.queue.push(Job::RunPhase {
                resource_id: resource.id,
                phase: next,
            });
        } else {
            self.queue.push(Job::Enrich {
                team_id: resource.team_id,
            });
        }
        self.queue.push(Job::Aggregate {
            team_id: resource.team_id,
        });
    }

    async fn fetch_phase(
        &self,
        resource: &TrackedResource,
        phase: SyncPhase,
        cancel: &crate::fetch::CancelToken,
    ) -> crate::error::Result<RunEnd> {
        let anchor = resource.started_at.unwrap_or_else(Utc::now);
        let lookback = resource.lookback_days.unwrap_or(self.config.lookback_days);
        let Some(window) = phase_window(phase, anchor, self.config.quick_window_days, lookback)
        else {
            return Ok(RunEnd::Finished(RunStats::default()));
        };

        let chunks = match phase {
            SyncPhase::Deep => window.split(self.config.deep_chunk_days),
            _ => window.split(0),
        };
        if chunks.is_empty() {
            self.store.set_total_items(resource.id, 0).await?;
            return Ok(RunEnd::Finished(RunStats::default()));
        }

        let settings = PagerSettings::from(&self.config);

        // Sharded: count every chunk so the phase total is known up front.
        let mut shards = VecDeque::new();
        if chunks.len() > 1 {
            let mut total = 0;
            for window in chunks {
                let Some(count) = self.count_window(resource, window, &settings, cancel).await?
                else {
                    return Ok(RunEnd::Cancelled);
                };
                let Some(pieces) = self
                    .narrow(resource, window, count, &settings, cancel)
                    .await?
                else {
                    return Ok(RunEnd::Cancelled);
                };
                total += pieces.iter().filter_map(|s| s.counted).sum::<u64>();
                shards.extend(pieces);
            }
            self.store.set_total_items(resource.id, total).await?;
            debug!(shards = shards.len(), total, "Phase window sharded");
        } else {
            shards.extend(chunks.into_iter().map(|window| Shard {
                window,
                counted: None,
            }));
        }

        let cap = self.config.max_results_per_filter;
        let mut stats = RunStats::default();
        'shards: while let Some(shard) = shards.pop_front() {
            let query = SearchQuery::new(&resource.owner, &resource.name, shard.window);
            let mut pager = SearchPager::new(
                self.source.as_ref(),
                &self.budget,
                query,
                settings,
                cancel.clone(),
            );
            loop {
                let page = match pager.next_page().await.map_err(TallyError::from)? {
                    PageStep::Page(page) => page,
                    PageStep::Done => break,
                    PageStep::Cancelled => return Ok(RunEnd::Cancelled),
                };

                if pager.pages() == 1 {
                    if page.total_count > cap && shard.window.halve().is_some() {
                        // Past the cap the remote stops paging; fetch narrower pieces instead.
                        let Some(pieces) = self
                            .narrow(resource, shard.window, page.total_count, &settings, cancel)
                            .await?
                        else {
                            return Ok(RunEnd::Cancelled);
                        };
                        let narrowed: u64 = pieces.iter().filter_map(|s| s.counted).sum();
                        self.reconcile_total(resource.id, shard.counted, narrowed)
                            .await?;
                        debug!(
                            pieces = pieces.len(),
                            matches = page.total_count,
                            cap,
                            "Filter over result cap, narrowed"
                        );
                        for piece in pieces.into_iter().rev() {
                            shards.push_front(piece);
                        }
                        continue 'shards;
                    }
                    self.reconcile_total(resource.id, shard.counted, page.total_count)
                        .await?;
                }

                let skipped = self.persist_page(resource.id, &page).await?;
                let processed = page.items.len() as u64;
                self.store.increment_completed(resource.id, processed).await?;
                stats.fetched += processed - skipped;
                stats.skipped += skipped;
                debug!(
                    page = pager.pages(),
                    items = processed,
                    skipped,
                    "Page persisted"
                );
            }
        }
        Ok(RunEnd::Finished(stats))
    }

    /// Halve `window` until every piece's match count fits under the remote's
    /// result cap. Pieces come back oldest first. `None` if cancelled.
    async fn narrow(
        &self,
        resource: &TrackedResource,
        window: DateWindow,
        count: u64,
        settings: &PagerSettings,
        cancel: &crate::fetch::CancelToken,
    ) -> crate::error::Result<Option<Vec<Shard>>> {
        let cap = self.config.max_results_per_filter;
        let mut pieces = Vec::new();
        let mut stack = vec![(window, count)];
        while let Some((window, count)) = stack.pop() {
            let halves = if count > cap { window.halve() } else { None };
            let Some((older, newer)) = halves else {
                if count > cap {
                    warn!(
                        from = %window.from,
                        to = %window.to,
                        count,
                        cap,
                        "Filter over result cap at minimum width; some records are unreachable"
                    );
                }
                pieces.push(Shard {
                    window,
                    counted: Some(count),
                });
                continue;
            };
            let Some(older_count) = self.count_window(resource, older, settings, cancel).await?
            else {
                return Ok(None);
            };
            let Some(newer_count) = self.count_window(resource, newer, settings, cancel).await?
            else {
                return Ok(None);
            };
            stack.push((newer, newer_count));
            stack.push((older, older_count));
        }
        Ok(Some(pieces))
    }

    async fn count_window(
        &self,
        resource: &TrackedResource,
        window: DateWindow,
        settings: &PagerSettings,
        cancel: &crate::fetch::CancelToken,
    ) -> crate::error::Result<Option<u64>> {
        let query = SearchQuery::new(&resource.owner, &resource.name, window);
        let count =
            SearchPager::count_matches(self.source.as_ref(), &self.budget, &query, settings, cancel)
                .await?;
        Ok(count)
    }

    /// Fold a shard's authoritative count into the phase total.
    async fn reconcile_total(
        &self,
        id: ResourceId,
        counted: Option<u64>,
        actual: u64,
    ) -> crate::error::Result<()> {
        match counted {
            Some(counted) => {
                let delta = to_signed(actual) - to_signed(counted);
                if delta != 0 {
                    self.store.adjust_total_items(id, delta).await?;
                }
            }
            None => self.store.set_total_items(id, actual).await?,
        }
        Ok(())
    }

    /// Upsert every valid item with its pattern classification. Returns the skip count.
    async fn persist_page(
        &self,
        id: ResourceId,
        page: &SearchPage,
    ) -> crate::error::Result<u64> {
        let mut skipped = 0;
        for item in &page.items {
            if let Err(violation) = validate_change(item) {
                warn!(error = %violation, "Skipping record that violates integrity");
                skipped += 1;
                continue;
            }
            let classification = self.detector.detect(item);
            self.store
                .upsert_change(id, item, Some(&classification))
                .await?;
        }
        Ok(skipped)
    }

    async fn require_resource(&self, id: ResourceId) -> crate::error::Result<TrackedResource> {
        self.store
            .get_resource(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("resource {id}")).into())
    }
}

fn to_signed(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
