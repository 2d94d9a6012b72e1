pub mod rules;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::store::SyncStore;
use crate::types::{Bucketing, InsightDraft, Rollup, TeamId};

pub use rules::default_rules;

/// Common interface for insight rules.
///
/// Rules are pure: they read the context and either produce a draft or not.
pub trait InsightRule: Send + Sync {
    /// Stable identifier, part of the dedup key.
    fn id(&self) -> &'static str;

    fn category(&self) -> &'static str;

    fn evaluate(&self, ctx: &RuleContext) -> crate::error::Result<Option<InsightDraft>>;
}

/// Metric values of one bucket, keyed by metric name.
#[derive(Debug, Clone, Default)]
pub struct BucketView {
    pub start: DateTime<Utc>,
    metrics: BTreeMap<String, (f64, u64)>,
}

impl BucketView {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            metrics: BTreeMap::new(),
        }
    }

    pub fn value(&self, metric: &str) -> Option<f64> {
        self.metrics.get(metric).map(|(v, _)| *v)
    }

    pub fn sample(&self, metric: &str) -> u64 {
        self.metrics.get(metric).map_or(0, |(_, n)| *n)
    }
}

/// The latest bucket and the baseline buckets preceding it.
#[derive(Debug, Clone)]
pub struct RuleContext {
    pub team_id: TeamId,
    pub bucketing: Bucketing,
    pub current: BucketView,
    /// Oldest first.
    pub baseline: Vec<BucketView>,
}

impl RuleContext {
    /// Split rollups into the latest closed bucket + up to `baseline_buckets`
    /// before it. The bucket containing `now` is still filling and is ignored.
    pub fn from_rollups(
        team_id: TeamId,
        bucketing: Bucketing,
        rollups: &[Rollup],
        baseline_buckets: usize,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let open = crate::aggregate::bucket_start(bucketing, now);
        let mut buckets: BTreeMap<DateTime<Utc>, BucketView> = BTreeMap::new();
        for rollup in rollups.iter().filter(|r| r.bucket_start < open) {
            buckets
                .entry(rollup.bucket_start)
                .or_insert_with(|| BucketView::new(rollup.bucket_start))
                .metrics
                .insert(rollup.metric.clone(), (rollup.value, rollup.sample_size));
        }
        let (_, current) = buckets.pop_last()?;
        let skip = buckets.len().saturating_sub(baseline_buckets);
        let baseline = buckets.into_values().skip(skip).collect();
        Some(Self {
            team_id,
            bucketing,
            current,
            baseline,
        })
    }

    /// Mean of `metric` over baseline buckets that have it.
    #[allow(clippy::cast_precision_loss)]
    pub fn baseline_mean(&self, metric: &str) -> Option<f64> {
        let values: Vec<f64> = self
            .baseline
            .iter()
            .filter_map(|b| b.value(metric))
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }
}

/// Statistics from one evaluation pass.
#[derive(Debug, Default)]
pub struct InsightStats {
    pub rules_run: u64,
    pub generated: u64,
    /// Drafts dropped because an insight for the same key already exists.
    pub duplicates: u64,
    pub errors: Vec<(String, crate::error::TallyError)>,
    pub duration: Duration,
}

/// Runs the rule registry against a team's latest rollups.
pub struct InsightEngine {
    store: Arc<dyn SyncStore>,
    rules: Vec<Box<dyn InsightRule>>,
    bucketing: Bucketing,
    baseline_buckets: usize,
}

impl std::fmt::Debug for InsightEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsightEngine")
            .field("rules", &self.rules.iter().map(|r| r.id()).collect::<Vec<_>>())
            .field("bucketing", &self.bucketing)
            .field("baseline_buckets", &self.baseline_buckets)
            .finish_non_exhaustive()
    }
}

impl InsightEngine {
    pub fn new(
        store: Arc<dyn SyncStore>,
        rules: Vec<Box<dyn InsightRule>>,
        bucketing: Bucketing,
        baseline_buckets: usize,
    ) -> Self {
        Self {
            store,
            rules,
            bucketing,
            baseline_buckets,
        }
    }

    /// Evaluate every rule. A failing rule is logged and the rest still run.
    pub async fn evaluate(&self, team_id: TeamId) -> crate::error::Result<InsightStats> {
        self.evaluate_at(team_id, Utc::now()).await
    }

    /// [`Self::evaluate`] with an explicit clock.
    #[instrument(skip_all, name = "insights", fields(team = %team_id))]
    pub async fn evaluate_at(
        &self,
        team_id: TeamId,
        now: DateTime<Utc>,
    ) -> crate::error::Result<InsightStats> {
        let start = Instant::now();
        let mut stats = InsightStats::default();

        let rollups = self.store.get_rollups(team_id, self.bucketing).await?;
        let Some(ctx) = RuleContext::from_rollups(
            team_id,
            self.bucketing,
            &rollups,
            self.baseline_buckets,
            now,
        ) else {
            debug!("No closed buckets yet, skipping insight rules");
            return Ok(stats);
        };

        for rule in &self.rules {
            stats.rules_run += 1;
            match rule.evaluate(&ctx) {
                Ok(Some(draft)) => {
                    match self
                        .store
                        .insert_insight(team_id, rule.id(), &draft, now)
                        .await?
                    {
                        Some(id) => {
                            info!(rule = rule.id(), %id, subject = %draft.subject, "Insight generated");
                            stats.generated += 1;
                        }
                        None => {
                            debug!(rule = rule.id(), "Insight already recorded for this window");
                            stats.duplicates += 1;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(rule = rule.id(), error = %e, "Insight rule failed");
                    stats.errors.push((rule.id().to_string(), e));
                }
            }
        }

        stats.duration = start.elapsed();
        info!(
            rules = stats.rules_run,
            generated = stats.generated,
            duplicates = stats.duplicates,
            errors = stats.errors.len(),
            duration = ?stats.duration,
            "Insight evaluation complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TallyError;
    use crate::store::sqlite::SqliteStore;
    use crate::types::InsightPriority;

    fn rollup(start: &str, metric: &str, value: f64, sample_size: u64) -> Rollup {
        Rollup {
            team_id: TeamId(1),
            bucketing: Bucketing::Week,
            bucket_start: start.parse().unwrap(),
            metric: metric.into(),
            value,
            sample_size,
        }
    }

    /// A clock well past every test bucket.
    fn later() -> DateTime<Utc> {
        "2024-06-01T00:00:00Z".parse().unwrap()
    }

    struct Always;

    impl InsightRule for Always {
        fn id(&self) -> &'static str {
            "always"
        }

        fn category(&self) -> &'static str {
            "test"
        }

        fn evaluate(&self, ctx: &RuleContext) -> crate::error::Result<Option<InsightDraft>> {
            Ok(Some(InsightDraft {
                category: self.category().into(),
                priority: InsightPriority::Low,
                subject: "pr_count".into(),
                window_start: ctx.current.start,
                payload: serde_json::json!({ "value": ctx.current.value("pr_count") }),
            }))
        }
    }

    struct Broken;

    impl InsightRule for Broken {
        fn id(&self) -> &'static str {
            "broken"
        }

        fn category(&self) -> &'static str {
            "test"
        }

        fn evaluate(&self, _ctx: &RuleContext) -> crate::error::Result<Option<InsightDraft>> {
            Err(TallyError::Rule {
                rule: "broken".into(),
                message: "division by zero".into(),
            })
        }
    }

    #[test]
    fn context_splits_latest_and_baseline() {
        let rollups = vec![
            rollup("2024-02-05T00:00:00Z", "pr_count", 1.0, 1),
            rollup("2024-02-12T00:00:00Z", "pr_count", 2.0, 2),
            rollup("2024-02-19T00:00:00Z", "pr_count", 4.0, 4),
            rollup("2024-02-26T00:00:00Z", "pr_count", 9.0, 9),
        ];
        let ctx =
            RuleContext::from_rollups(TeamId(1), Bucketing::Week, &rollups, 2, later()).unwrap();
        assert_eq!(ctx.current.start, "2024-02-26T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(ctx.current.value("pr_count"), Some(9.0));
        assert_eq!(ctx.current.sample("pr_count"), 9);
        assert_eq!(ctx.baseline.len(), 2);
        assert_eq!(ctx.baseline_mean("pr_count"), Some(3.0));
        assert_eq!(ctx.baseline_mean("merge_rate"), None);

        assert!(RuleContext::from_rollups(TeamId(1), Bucketing::Week, &[], 4, later()).is_none());
    }

    #[test]
    fn bucket_still_filling_is_not_current() {
        let rollups = vec![
            rollup("2024-02-12T00:00:00Z", "pr_count", 2.0, 2),
            rollup("2024-02-19T00:00:00Z", "pr_count", 4.0, 4),
            rollup("2024-02-26T00:00:00Z", "pr_count", 1.0, 1),
        ];
        // Wednesday of the 2024-02-26 week
        let midweek = "2024-02-28T15:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let ctx =
            RuleContext::from_rollups(TeamId(1), Bucketing::Week, &rollups, 4, midweek).unwrap();
        assert_eq!(ctx.current.start, "2024-02-19T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(ctx.current.value("pr_count"), Some(4.0));
        assert_eq!(ctx.baseline.len(), 1);

        // Only the open bucket: nothing to judge yet
        let first_week = "2024-02-12T09:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(
            RuleContext::from_rollups(TeamId(1), Bucketing::Week, &rollups[..1], 4, first_week)
                .is_none()
        );
    }

    #[tokio::test]
    async fn partial_week_does_not_read_as_throughput_drop() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let team = store.ensure_team("core").await.unwrap();
        let rollups: Vec<_> = [
            ("2024-01-29T00:00:00Z", 20.0),
            ("2024-02-05T00:00:00Z", 20.0),
            ("2024-02-12T00:00:00Z", 20.0),
            ("2024-02-19T00:00:00Z", 20.0),
            ("2024-02-26T00:00:00Z", 3.0),
        ]
        .into_iter()
        .map(|(start, n)| rollup(start, crate::aggregate::PR_COUNT, n, 20))
        .collect();
        store.replace_rollups(team, Bucketing::Week, &rollups).await.unwrap();
        let engine = InsightEngine::new(
            store.clone(),
            default_rules(&crate::config::InsightsSection::default()),
            Bucketing::Week,
            4,
        );

        // Tuesday morning: the 2024-02-26 week has barely started
        let tuesday = "2024-02-27T09:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let stats = engine.evaluate_at(team, tuesday).await.unwrap();
        assert!(stats.errors.is_empty());
        assert_eq!(stats.generated, 0);
        assert!(store.list_insights(team, false).await.unwrap().is_empty());

        // Once the week has closed, the same count is a real drop
        let next_monday = "2024-03-04T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        engine.evaluate_at(team, next_monday).await.unwrap();
        let insights = store.list_insights(team, false).await.unwrap();
        let drop = insights
            .iter()
            .find(|i| i.rule_id == "throughput-drop")
            .expect("drop after the week closes");
        assert_eq!(drop.window_start, "2024-02-26T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[tokio::test]
    async fn failing_rule_does_not_stop_others_and_duplicates_are_skipped() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let team = store.ensure_team("core").await.unwrap();
        store
            .replace_rollups(
                team,
                Bucketing::Week,
                &[rollup("2024-02-26T00:00:00Z", "pr_count", 3.0, 3)],
            )
            .await
            .unwrap();

        let engine = InsightEngine::new(
            store.clone(),
            vec![Box::new(Broken), Box::new(Always)],
            Bucketing::Week,
            4,
        );
        let stats = engine.evaluate(team).await.unwrap();
        assert_eq!(stats.rules_run, 2);
        assert_eq!(stats.generated, 1);
        assert_eq!(stats.errors.len(), 1);
        assert_eq!(stats.errors[0].0, "broken");

        let again = engine.evaluate(team).await.unwrap();
        assert_eq!(again.generated, 0);
        assert_eq!(again.duplicates, 1);
        assert_eq!(store.list_insights(team, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dismissed_insight_is_not_regenerated() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let team = store.ensure_team("core").await.unwrap();
        store
            .replace_rollups(
                team,
                Bucketing::Week,
                &[rollup("2024-02-26T00:00:00Z", "pr_count", 3.0, 3)],
            )
            .await
            .unwrap();
        let engine = InsightEngine::new(store.clone(), vec![Box::new(Always)], Bucketing::Week, 4);
        engine.evaluate(team).await.unwrap();

        let insight = store.list_insights(team, false).await.unwrap().remove(0);
        assert!(store.dismiss_insight(insight.id, Utc::now()).await.unwrap());
        // Dismissing twice is a no-op.
        assert!(!store.dismiss_insight(insight.id, Utc::now()).await.unwrap());

        let stats = engine.evaluate(team).await.unwrap();
        assert_eq!(stats.generated, 0);
        assert!(store.list_insights(team, false).await.unwrap().is_empty());
        assert_eq!(store.list_insights(team, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_rollups_is_a_no_op() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let team = store.ensure_team("core").await.unwrap();
        let engine = InsightEngine::new(store, vec![Box::new(Always)], Bucketing::Week, 4);
        let stats = engine.evaluate(team).await.unwrap();
        assert_eq!(stats.rules_run, 0);
    }
}
