//! Job dispatch: Sync → Enrich → Aggregate → Insights.
//!
//! [`TallyPipeline`] is the [`JobHandler`] behind the worker pool. Phase
//! runs chain their own follow-ups; an enrichment sweep is followed by a
//! recompute; a recompute is followed by insight evaluation. Enrichment is
//! also queued on a timer, apart from any sync.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregate::{AggregationEngine, RecomputeStats};
use crate::config::TallyConfig;
use crate::enrich::{EnrichmentQueue, InferenceProvider, SweepStats};
use crate::fetch::{RateBudget, SearchSource};
use crate::insight::{InsightEngine, InsightStats, default_rules};
use crate::store::SyncStore;
use crate::sync::{Job, JobHandler, JobReceiver, SyncOrchestrator, WorkQueue, WorkerPool};
use crate::types::{Bucketing, TeamId};

/// Owns every pipeline stage and routes queued jobs to them.
pub struct TallyPipeline {
    store: Arc<dyn SyncStore>,
    orchestrator: SyncOrchestrator,
    /// `None` when no inference provider is configured; pattern data stands alone.
    enrichment: Option<EnrichmentQueue>,
    aggregation: AggregationEngine,
    insights: InsightEngine,
    bucketing: Bucketing,
}

impl std::fmt::Debug for TallyPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TallyPipeline")
            .field("orchestrator", &self.orchestrator)
            .field("enrichment", &self.enrichment)
            .field("bucketing", &self.bucketing)
            .finish_non_exhaustive()
    }
}

impl TallyPipeline {
    pub fn new(
        store: Arc<dyn SyncStore>,
        source: Arc<dyn SearchSource>,
        budget: Arc<RateBudget>,
        inference: Option<Arc<dyn InferenceProvider>>,
        config: &TallyConfig,
        queue: WorkQueue,
    ) -> Self {
        let bucketing = config.aggregation.bucketing;
        Self {
            orchestrator: SyncOrchestrator::new(
                Arc::clone(&store),
                source,
                budget,
                queue,
                config.sync.clone(),
            ),
            enrichment: inference.map(|provider| {
                EnrichmentQueue::new(
                    Arc::clone(&store),
                    provider,
                    config.enrichment.clone(),
                    config.llm.cost_budget,
                )
            }),
            aggregation: AggregationEngine::new(Arc::clone(&store)),
            insights: InsightEngine::new(
                Arc::clone(&store),
                default_rules(&config.insights),
                bucketing,
                config.insights.baseline_buckets,
            ),
            bucketing,
            store,
        }
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub fn queue(&self) -> &WorkQueue {
        self.orchestrator.queue()
    }

    /// Spawn `workers` tasks draining the queue into this pipeline.
    pub fn start(self: &Arc<Self>, receiver: &JobReceiver, workers: usize) -> WorkerPool {
        WorkerPool::spawn(
            workers,
            receiver,
            self.queue(),
            Arc::clone(self) as Arc<dyn JobHandler>,
        )
    }

    /// Queue an enrichment sweep for every team once per `period`.
    ///
    /// The first round is queued one period after the call. The task ends on
    /// its own once the pipeline is dropped.
    pub fn start_enrichment_timer(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let period = period.max(Duration::from_secs(1));
        let pipeline = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(pipeline) = pipeline.upgrade() else {
                    break;
                };
                match pipeline.queue_sweeps().await {
                    Ok(teams) => debug!(teams, "Periodic enrichment queued"),
                    Err(e) => warn!(error = %e, "Cannot queue periodic enrichment"),
                }
            }
        })
    }

    /// Push one enrichment job per team. Returns how many were queued.
    pub async fn queue_sweeps(&self) -> crate::error::Result<usize> {
        if self.enrichment.is_none() {
            return Ok(0);
        }
        let teams = self.store.list_teams().await?;
        for team in &teams {
            self.queue().push(Job::Enrich { team_id: team.id });
        }
        Ok(teams.len())
    }

    /// Run one enrichment sweep. `None` without an inference provider.
    pub async fn enrich(&self, team_id: TeamId) -> crate::error::Result<Option<SweepStats>> {
        match &self.enrichment {
            Some(queue) => queue.sweep(team_id).await.map(Some),
            None => {
                debug!(team = %team_id, "No inference provider configured, skipping sweep");
                Ok(None)
            }
        }
    }

    /// Recompute rollups, then evaluate insight rules on them.
    pub async fn aggregate(
        &self,
        team_id: TeamId,
    ) -> crate::error::Result<(RecomputeStats, InsightStats)> {
        let rollups = self.aggregation.recompute(team_id, self.bucketing).await?;
        let insights = self.insights.evaluate(team_id).await?;
        Ok((rollups, insights))
    }
}

#[async_trait::async_trait]
impl JobHandler for TallyPipeline {
    async fn handle(&self, job: Job) {
        match job {
            Job::RunPhase { resource_id, phase } => {
                match self.orchestrator.run_phase(resource_id, phase).await {
                    Ok(outcome) => debug!(resource = %resource_id, %phase, ?outcome, "Phase job done"),
                    Err(e) => error!(resource = %resource_id, %phase, error = %e, "Phase job errored"),
                }
            }
            Job::Enrich { team_id } => match self.enrich(team_id).await {
                Ok(Some(stats)) => {
                    info!(team = %team_id, enriched = stats.enriched, "Enrichment job done");
                    self.queue().push(Job::Aggregate { team_id });
                }
                Ok(None) => {}
                // Enrichment never escalates to sync state.
                Err(e) => error!(team = %team_id, error = %e, "Enrichment job errored"),
            },
            Job::Aggregate { team_id } => {
                if let Err(e) = self.aggregate(team_id).await {
                    error!(team = %team_id, error = %e, "Aggregation job errored");
                }
            }
        }
    }
}
