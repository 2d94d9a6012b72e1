// Inference sweep: keyset-paged batches with retry, a circuit breaker, and a cost ceiling.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::inference::{InferenceOutput, InferenceProvider, InferenceRequest};
use crate::config::EnrichmentSection;
use crate::error::EnrichError;
use crate::llm::CostTracker;
use crate::store::SyncStore;
use crate::types::{ChangeRecordId, TeamId};

/// Why a sweep stopped before running out of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepHalt {
    /// Consecutive batch failures reached the breaker threshold.
    CircuitOpen,
    /// The sweep spent its cost budget.
    BudgetExhausted,
}

/// Summary of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepStats {
    /// Records pulled into a batch.
    pub selected: u64,
    /// Records whose inference classification was stored.
    pub enriched: u64,
    /// Batches left for a later sweep after exhausting their attempts.
    pub deferred_batches: u64,
    /// Records in a successful batch the provider did not answer for.
    pub skipped: u64,
    pub halted: Option<SweepHalt>,
    pub cost_usd: f64,
}

/// Selects records lacking an inference classification and submits them in batches.
///
/// There is no claim flag: the stored inference result is the only state, so an
/// interrupted sweep simply finds the unfinished records again next time.
pub struct EnrichmentQueue {
    store: Arc<dyn SyncStore>,
    provider: Arc<dyn InferenceProvider>,
    config: EnrichmentSection,
    /// USD ceiling per sweep; 0 means unlimited.
    cost_budget: f64,
    /// Teams with a sweep in progress.
    active: Mutex<HashSet<TeamId>>,
}

/// A team's sweep slot, released on drop.
struct SweepClaim<'a> {
    active: &'a Mutex<HashSet<TeamId>>,
    team_id: TeamId,
}

impl Drop for SweepClaim<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.team_id);
    }
}

impl std::fmt::Debug for EnrichmentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentQueue")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .field("cost_budget", &self.cost_budget)
            .finish_non_exhaustive()
    }
}

impl EnrichmentQueue {
    pub fn new(
        store: Arc<dyn SyncStore>,
        provider: Arc<dyn InferenceProvider>,
        config: EnrichmentSection,
        cost_budget: f64,
    ) -> Self {
        Self {
            store,
            provider,
            config,
            cost_budget,
            active: Mutex::default(),
        }
    }

    /// `None` while another sweep of the team is running.
    fn claim(&self, team_id: TeamId) -> Option<SweepClaim<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.insert(team_id).then(|| SweepClaim {
            active: &self.active,
            team_id,
        })
    }

    /// Run one sweep over the team's pending records.
    ///
    /// Paging is keyed on record id, so no record is selected twice within a
    /// sweep, including records of deferred batches.
    #[instrument(skip_all, name = "enrich_sweep", fields(team = %team_id, provider = self.provider.name()))]
    pub async fn sweep(&self, team_id: TeamId) -> crate::error::Result<SweepStats> {
        let Some(_claim) = self.claim(team_id) else {
            debug!("Sweep already running for team, skipping");
            return Ok(SweepStats::default());
        };
        let batch_size = self.config.effective_batch_size();
        let mut stats = SweepStats::default();
        let mut costs = CostTracker::default();
        let mut after: Option<ChangeRecordId> = None;
        let mut consecutive_failures = 0u32;

        loop {
            if costs.is_over_budget(self.cost_budget) {
                warn!(
                    spent = costs.estimated_cost_usd,
                    budget = self.cost_budget,
                    "Inference budget reached, stopping sweep"
                );
                stats.halted = Some(SweepHalt::BudgetExhausted);
                break;
            }

            let records = self
                .store
                .changes_pending_inference(team_id, after, batch_size)
                .await?;
            let Some(last) = records.last() else {
                break;
            };
            after = Some(last.id);
            stats.selected += records.len() as u64;

            let requests: Vec<InferenceRequest> = records
                .iter()
                .map(|r| InferenceRequest::from_record(r, self.config.max_summary_chars))
                .collect();

            match self.submit(&requests, &mut costs).await {
                Ok(output) => {
                    consecutive_failures = 0;
                    costs.record_spend(&output.usage, output.cost_usd);
                    let enriched = self.store_batch(&requests, output).await?;
                    stats.enriched += enriched;
                    stats.skipped += requests.len() as u64 - enriched;
                }
                Err(err) => {
                    consecutive_failures += 1;
                    costs.record_failure();
                    stats.deferred_batches += 1;
                    warn!(
                        batch = requests.len(),
                        error = %err,
                        "Inference batch deferred to a later sweep"
                    );
                    if consecutive_failures >= self.config.circuit_breaker_threshold.max(1) {
                        warn!(consecutive_failures, "Inference provider unavailable, stopping sweep");
                        stats.halted = Some(SweepHalt::CircuitOpen);
                        break;
                    }
                }
            }
        }

        stats.cost_usd = costs.estimated_cost_usd;
        info!(
            selected = stats.selected,
            enriched = stats.enriched,
            deferred = stats.deferred_batches,
            skipped = stats.skipped,
            "Enrichment sweep finished"
        );
        Ok(stats)
    }

    /// Submit a batch, retrying with exponential backoff up to `max_attempts`.
    ///
    /// Billed failures are charged to `costs`; retries stop once the budget is spent.
    async fn submit(
        &self,
        requests: &[InferenceRequest],
        costs: &mut CostTracker,
    ) -> Result<InferenceOutput, EnrichError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut delay = Duration::from_millis(self.config.initial_backoff_ms);
        let mut attempt = 1;
        loop {
            let err = match self.provider.classify(requests).await {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            if let Some((usage, cost_usd)) = err.spend() {
                costs.record_spend(&usage, cost_usd);
            }
            if attempt >= max_attempts || costs.is_over_budget(self.cost_budget) {
                return Err(err);
            }
            warn!(attempt, batch = requests.len(), error = %err, "Inference batch failed, retrying");
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
            attempt += 1;
        }
    }

    async fn store_batch(
        &self,
        requests: &[InferenceRequest],
        output: InferenceOutput,
    ) -> crate::error::Result<u64> {
        let mut expected: HashSet<ChangeRecordId> = requests.iter().map(|r| r.id).collect();
        let mut enriched = 0;
        for (id, classification) in output.classifications {
            if !expected.remove(&id) {
                debug!(%id, "Provider answered for a record outside the batch");
                continue;
            }
            if self.store.store_inference(id, &classification).await? {
                enriched += 1;
            }
        }
        if !expected.is_empty() {
            debug!(missing = expected.len(), "Records left for a later sweep");
        }
        Ok(enriched)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::llm::TokenUsage;
    use crate::store::sqlite::SqliteStore;
    use crate::types::{ChangeState, Classification, ClassificationSource, RemoteChange};

    /// Classifies everything it is sent, except for scripted failures and omissions.
    #[derive(Debug, Default)]
    struct Scripted {
        /// Calls (1-based) that fail.
        fail_calls: Vec<usize>,
        /// Fail every call.
        always_fail: bool,
        /// Answer for at most this many records per batch.
        answer_limit: Option<usize>,
        cost_per_batch: f64,
        /// Bill every call but reply with something unparseable.
        garbled: bool,
        calls: AtomicUsize,
        seen: Mutex<Vec<ChangeRecordId>>,
    }

    #[async_trait::async_trait]
    impl InferenceProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn classify(&self, batch: &[InferenceRequest]) -> Result<InferenceOutput, EnrichError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.always_fail || self.fail_calls.contains(&call) {
                return Err(EnrichError::ProviderUnavailable("503".into()));
            }
            if self.garbled {
                return Err(EnrichError::Parse {
                    message: "no JSON array in response".into(),
                    usage: TokenUsage {
                        input_tokens: 4000,
                        output_tokens: 800,
                    },
                    cost_usd: self.cost_per_batch,
                });
            }
            self.seen.lock().unwrap().extend(batch.iter().map(|r| r.id));
            let answered = batch.len().min(self.answer_limit.unwrap_or(usize::MAX));
            Ok(InferenceOutput {
                classifications: batch[..answered]
                    .iter()
                    .map(|r| {
                        (
                            r.id,
                            Classification {
                                is_ai_assisted: true,
                                confidence: Some(0.9),
                                ..Classification::default()
                            },
                        )
                    })
                    .collect(),
                usage: TokenUsage::default(),
                cost_usd: self.cost_per_batch,
            })
        }
    }

    fn change(i: u64) -> RemoteChange {
        RemoteChange {
            remote_id: format!("PR_{i}"),
            number: i,
            title: format!("Change {i}"),
            body: None,
            author: Some("alice".into()),
            head_ref: None,
            state: ChangeState::Open,
            created_at: "2024-03-01T00:00:00Z".parse().unwrap(),
            updated_at: None,
            merged_at: None,
            additions: 1,
            deletions: 0,
            reviews: Vec::new(),
            files: Vec::new(),
            commits: Vec::new(),
        }
    }

    async fn seeded(n: u64) -> (Arc<SqliteStore>, TeamId) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let team = store.ensure_team("core").await.unwrap();
        let resource = store.track_resource(team, "acme", "api").await.unwrap();
        for i in 1..=n {
            store.upsert_change(resource, &change(i), None).await.unwrap();
        }
        (store, team)
    }

    fn config(batch_size: usize) -> EnrichmentSection {
        EnrichmentSection {
            batch_size,
            initial_backoff_ms: 10,
            ..EnrichmentSection::default()
        }
    }

    fn queue(store: &Arc<SqliteStore>, provider: &Arc<Scripted>, cfg: EnrichmentSection, budget: f64) -> EnrichmentQueue {
        EnrichmentQueue::new(store.clone(), provider.clone(), cfg, budget)
    }

    #[tokio::test]
    async fn sweep_enriches_everything_in_batches() {
        let (store, team) = seeded(25).await;
        let provider = Arc::new(Scripted::default());
        let stats = queue(&store, &provider, config(10), 0.0).sweep(team).await.unwrap();

        assert_eq!(stats.selected, 25);
        assert_eq!(stats.enriched, 25);
        assert_eq!(stats.deferred_batches, 0);
        assert_eq!(stats.halted, None);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

        let records = store.changes_for_team(team).await.unwrap();
        assert!(
            records
                .iter()
                .all(|r| r.classification_source == ClassificationSource::Inference)
        );
    }

    #[tokio::test]
    async fn inference_classified_records_are_never_resubmitted() {
        let (store, team) = seeded(12).await;
        let provider = Arc::new(Scripted::default());
        let q = queue(&store, &provider, config(5), 0.0);
        q.sweep(team).await.unwrap();
        let first = provider.seen.lock().unwrap().len();

        let stats = q.sweep(team).await.unwrap();
        assert_eq!(stats.selected, 0);
        assert_eq!(provider.seen.lock().unwrap().len(), first);
    }

    #[tokio::test]
    async fn interrupted_batch_resumes_with_only_the_remainder() {
        let (store, team) = seeded(50).await;
        let partial = Arc::new(Scripted {
            answer_limit: Some(40),
            ..Scripted::default()
        });
        let stats = queue(&store, &partial, config(50), 0.0).sweep(team).await.unwrap();
        assert_eq!(stats.enriched, 40);
        assert_eq!(stats.skipped, 10);

        let full = Arc::new(Scripted::default());
        let stats = queue(&store, &full, config(50), 0.0).sweep(team).await.unwrap();
        assert_eq!(stats.selected, 10);
        assert_eq!(stats.enriched, 10);
        let mut seen = full.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen.len(), 10);
        assert!(seen.iter().all(|id| id.0 > 40));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_within_the_batch() {
        let (store, team) = seeded(4).await;
        let provider = Arc::new(Scripted {
            fail_calls: vec![1, 2],
            ..Scripted::default()
        });
        let stats = queue(&store, &provider, config(10), 0.0).sweep(team).await.unwrap();
        assert_eq!(stats.enriched, 4);
        assert_eq!(stats.deferred_batches, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_provider_defers_and_trips_breaker() {
        let (store, team) = seeded(30).await;
        let provider = Arc::new(Scripted {
            always_fail: true,
            ..Scripted::default()
        });
        let stats = queue(&store, &provider, config(5), 0.0).sweep(team).await.unwrap();

        // Two consecutive failed batches (3 attempts each) open the breaker.
        assert_eq!(stats.deferred_batches, 2);
        assert_eq!(stats.selected, 10);
        assert_eq!(stats.enriched, 0);
        assert_eq!(stats.halted, Some(SweepHalt::CircuitOpen));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 6);

        // Nothing was dropped: every record is still pending.
        let pending = store.changes_pending_inference(team, None, 100).await.unwrap();
        assert_eq!(pending.len(), 30);
    }

    #[tokio::test]
    async fn budget_stops_submission() {
        let (store, team) = seeded(30).await;
        let provider = Arc::new(Scripted {
            cost_per_batch: 0.6,
            ..Scripted::default()
        });
        let stats = queue(&store, &provider, config(10), 1.0).sweep(team).await.unwrap();
        assert_eq!(stats.enriched, 20);
        assert_eq!(stats.halted, Some(SweepHalt::BudgetExhausted));
        assert!((stats.cost_usd - 1.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn overlapping_sweep_of_same_team_is_skipped() {
        let (store, team) = seeded(5).await;
        let provider = Arc::new(Scripted::default());
        let q = queue(&store, &provider, config(10), 0.0);

        let held = q.claim(team).unwrap();
        let stats = q.sweep(team).await.unwrap();
        assert_eq!(stats, SweepStats::default());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        drop(held);
        assert_eq!(q.sweep(team).await.unwrap().enriched, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn garbled_replies_count_toward_budget() {
        let (store, team) = seeded(30).await;
        let provider = Arc::new(Scripted {
            garbled: true,
            cost_per_batch: 0.4,
            ..Scripted::default()
        });
        let stats = queue(&store, &provider, config(10), 1.0).sweep(team).await.unwrap();

        // Three billed attempts pass the budget; nothing further is submitted.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.deferred_batches, 1);
        assert_eq!(stats.enriched, 0);
        assert_eq!(stats.halted, Some(SweepHalt::BudgetExhausted));
        assert!((stats.cost_usd - 1.2).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_once_budget_is_spent() {
        let (store, team) = seeded(5).await;
        let provider = Arc::new(Scripted {
            garbled: true,
            cost_per_batch: 0.6,
            ..Scripted::default()
        });
        let stats = queue(&store, &provider, config(10), 1.0).sweep(team).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(stats.halted, Some(SweepHalt::BudgetExhausted));
    }
}
