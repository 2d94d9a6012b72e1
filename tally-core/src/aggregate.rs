// Time-bucketed rollups, recomputed wholesale from change records.
//
// Statistical computations intentionally cast int→float.
#![allow(clippy::cast_precision_loss)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use tracing::{info, instrument};

use crate::store::SyncStore;
use crate::types::{Bucketing, ChangeRecord, ChangeState, Rollup, TeamId};

pub const PR_COUNT: &str = "pr_count";
pub const MERGED_COUNT: &str = "merged_count";
pub const MERGE_RATE: &str = "merge_rate";
pub const AI_ASSISTED_COUNT: &str = "ai_assisted_count";
pub const AI_ASSISTED_RATE: &str = "ai_assisted_rate";
pub const CLASSIFIED_COUNT: &str = "classified_count";
pub const LINES_ADDED: &str = "lines_added";
pub const LINES_REMOVED: &str = "lines_removed";
pub const MEDIAN_HOURS_TO_MERGE: &str = "median_hours_to_merge";
pub const P90_HOURS_TO_MERGE: &str = "p90_hours_to_merge";
pub const MEDIAN_HOURS_TO_FIRST_REVIEW: &str = "median_hours_to_first_review";
/// Prefix of per-category count metrics, e.g. `category:backend`.
pub const CATEGORY_PREFIX: &str = "category:";

/// Summary of one recompute.
#[derive(Debug, Clone, Default)]
pub struct RecomputeStats {
    pub records: usize,
    pub buckets: usize,
    pub rollups: usize,
    pub duration: Duration,
}

/// Rebuilds a team's rollups from whatever records and classifications exist now.
#[derive(Clone)]
pub struct AggregationEngine {
    store: Arc<dyn SyncStore>,
}

impl std::fmt::Debug for AggregationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationEngine").finish_non_exhaustive()
    }
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// Replace every rollup for `(team, bucketing)` in one write.
    #[instrument(skip_all, name = "recompute", fields(team = %team_id, bucketing = bucketing.as_str()))]
    pub async fn recompute(
        &self,
        team_id: TeamId,
        bucketing: Bucketing,
    ) -> crate::error::Result<RecomputeStats> {
        let start = Instant::now();
        let records = self.store.changes_for_team(team_id).await?;
        let rollups = compute_rollups(team_id, bucketing, &records);
        self.store
            .replace_rollups(team_id, bucketing, &rollups)
            .await?;

        let stats = RecomputeStats {
            records: records.len(),
            buckets: rollups
                .iter()
                .map(|r| r.bucket_start)
                .collect::<BTreeSet<_>>()
                .len(),
            rollups: rollups.len(),
            duration: start.elapsed(),
        };
        info!(
            records = stats.records,
            buckets = stats.buckets,
            rollups = stats.rollups,
            duration = ?stats.duration,
            "Rollups recomputed"
        );
        Ok(stats)
    }
}

/// Start of the bucket containing `at` (UTC). Weeks start on Monday.
pub fn bucket_start(bucketing: Bucketing, at: DateTime<Utc>) -> DateTime<Utc> {
    let date = at.date_naive();
    let start = match bucketing {
        Bucketing::Day => date,
        Bucketing::Week => date - chrono::Duration::days(i64::from(date.weekday().num_days_from_monday())),
        Bucketing::Month => date - chrono::Duration::days(i64::from(date.day0())),
    };
    start.and_time(NaiveTime::MIN).and_utc()
}

/// Pure rollup computation. Output is sorted by `(bucket_start, metric)` and
/// depends only on the set of records, not their order.
pub fn compute_rollups(
    team_id: TeamId,
    bucketing: Bucketing,
    records: &[ChangeRecord],
) -> Vec<Rollup> {
    let mut buckets: BTreeMap<DateTime<Utc>, Vec<&ChangeRecord>> = BTreeMap::new();
    for record in records {
        buckets
            .entry(bucket_start(bucketing, record.change.created_at))
            .or_default()
            .push(record);
    }

    let mut rollups = Vec::new();
    for (start, bucket) in buckets {
        let mut metrics = bucket_metrics(&bucket);
        metrics.sort_by(|a, b| a.0.cmp(&b.0));
        rollups.extend(metrics.into_iter().map(|(metric, value, sample_size)| Rollup {
            team_id,
            bucketing,
            bucket_start: start,
            metric,
            value: round4(value),
            sample_size,
        }));
    }
    rollups
}

/// `(metric, value, sample_size)` for one bucket.
fn bucket_metrics(bucket: &[&ChangeRecord]) -> Vec<(String, f64, u64)> {
    let total = bucket.len() as u64;
    let merged = bucket
        .iter()
        .filter(|r| r.change.state == ChangeState::Merged)
        .count() as u64;
    let classified: Vec<_> = bucket
        .iter()
        .filter_map(|r| r.effective_classification())
        .collect();
    let classified_count = classified.len() as u64;
    let ai_assisted = classified.iter().filter(|c| c.is_ai_assisted).count() as u64;

    let mut out = vec![
        (PR_COUNT.to_string(), total as f64, total),
        (MERGED_COUNT.to_string(), merged as f64, total),
        (MERGE_RATE.to_string(), ratio(merged, total), total),
        (CLASSIFIED_COUNT.to_string(), classified_count as f64, total),
        (
            LINES_ADDED.to_string(),
            bucket.iter().map(|r| r.change.additions).sum::<u64>() as f64,
            total,
        ),
        (
            LINES_REMOVED.to_string(),
            bucket.iter().map(|r| r.change.deletions).sum::<u64>() as f64,
            total,
        ),
    ];

    if classified_count > 0 {
        out.push((AI_ASSISTED_COUNT.to_string(), ai_assisted as f64, classified_count));
        out.push((
            AI_ASSISTED_RATE.to_string(),
            ratio(ai_assisted, classified_count),
            classified_count,
        ));
        let mut categories: BTreeMap<&str, u64> = BTreeMap::new();
        for classification in &classified {
            for category in &classification.categories {
                *categories.entry(category.as_str()).or_default() += 1;
            }
        }
        for (category, count) in categories {
            out.push((
                format!("{CATEGORY_PREFIX}{category}"),
                count as f64,
                classified_count,
            ));
        }
    }

    let merge_hours = sorted_hours(bucket.iter().filter_map(|r| {
        r.change.merged_at.map(|m| m - r.change.created_at)
    }));
    if !merge_hours.is_empty() {
        let n = merge_hours.len() as u64;
        out.push((MEDIAN_HOURS_TO_MERGE.to_string(), percentile(&merge_hours, 0.5), n));
        out.push((P90_HOURS_TO_MERGE.to_string(), percentile(&merge_hours, 0.9), n));
    }

    let review_hours = sorted_hours(
        bucket
            .iter()
            .filter_map(|r| r.first_review_at().map(|at| at - r.change.created_at)),
    );
    if !review_hours.is_empty() {
        out.push((
            MEDIAN_HOURS_TO_FIRST_REVIEW.to_string(),
            percentile(&review_hours, 0.5),
            review_hours.len() as u64,
        ));
    }

    out
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn sorted_hours(durations: impl Iterator<Item = chrono::Duration>) -> Vec<f64> {
    let mut hours: Vec<f64> = durations
        .map(|d| d.num_seconds().max(0) as f64 / 3600.0)
        .collect();
    hours.sort_by(f64::total_cmp);
    hours
}

/// Linear-interpolated percentile of an ascending, non-empty slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted {
        [] => 0.0,
        [only] => *only,
        _ => {
            let rank = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let lo = rank.floor() as usize;
            let hi = (lo + 1).min(sorted.len() - 1);
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::store::sqlite::SqliteStore;
    use crate::types::{
        ChangeRecordId, Classification, ClassificationSource, RemoteChange, ResourceId,
        ReviewEvent,
    };

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn record(id: i64, created: &str, merged: Option<&str>, ai: Option<bool>) -> ChangeRecord {
        ChangeRecord {
            id: ChangeRecordId(id),
            resource_id: ResourceId(1),
            change: RemoteChange {
                remote_id: format!("PR_{id}"),
                number: id.unsigned_abs(),
                title: "t".into(),
                body: None,
                author: None,
                head_ref: None,
                state: if merged.is_some() {
                    ChangeState::Merged
                } else {
                    ChangeState::Open
                },
                created_at: ts(created),
                updated_at: None,
                merged_at: merged.map(ts),
                additions: 10,
                deletions: 4,
                reviews: Vec::new(),
                files: Vec::new(),
                commits: Vec::new(),
            },
            pattern_classification: ai.map(|is_ai_assisted| Classification {
                is_ai_assisted,
                categories: BTreeSet::from(["backend".to_string()]),
                ..Classification::default()
            }),
            inference_classification: None,
            classification_source: if ai.is_some() {
                ClassificationSource::Pattern
            } else {
                ClassificationSource::None
            },
        }
    }

    fn metric<'a>(rollups: &'a [Rollup], start: &str, name: &str) -> Option<&'a Rollup> {
        rollups
            .iter()
            .find(|r| r.bucket_start == ts(start) && r.metric == name)
    }

    #[test]
    fn bucket_boundaries() {
        // 2024-03-06 is a Wednesday.
        let at = ts("2024-03-06T15:30:00Z");
        assert_eq!(bucket_start(Bucketing::Day, at), ts("2024-03-06T00:00:00Z"));
        assert_eq!(bucket_start(Bucketing::Week, at), ts("2024-03-04T00:00:00Z"));
        assert_eq!(bucket_start(Bucketing::Month, at), ts("2024-03-01T00:00:00Z"));
        // Sunday belongs to the week that started the Monday before.
        assert_eq!(
            bucket_start(Bucketing::Week, ts("2024-03-10T23:59:59Z")),
            ts("2024-03-04T00:00:00Z")
        );
    }

    #[test]
    fn weekly_metrics() {
        let records = vec![
            record(1, "2024-03-04T00:00:00Z", Some("2024-03-04T10:00:00Z"), Some(true)),
            record(2, "2024-03-05T00:00:00Z", Some("2024-03-05T20:00:00Z"), Some(false)),
            record(3, "2024-03-06T00:00:00Z", None, None),
            record(4, "2024-03-12T00:00:00Z", None, Some(true)),
        ];
        let rollups = compute_rollups(TeamId(1), Bucketing::Week, &records);
        let week = "2024-03-04T00:00:00Z";

        let count = metric(&rollups, week, PR_COUNT).unwrap();
        assert!((count.value - 3.0).abs() < f64::EPSILON);
        assert_eq!(count.sample_size, 3);

        let rate = metric(&rollups, week, MERGE_RATE).unwrap();
        assert!((rate.value - 0.6667).abs() < 1e-9);

        let ai = metric(&rollups, week, AI_ASSISTED_RATE).unwrap();
        assert!((ai.value - 0.5).abs() < f64::EPSILON);
        assert_eq!(ai.sample_size, 2);

        let median = metric(&rollups, week, MEDIAN_HOURS_TO_MERGE).unwrap();
        assert!((median.value - 15.0).abs() < f64::EPSILON);
        assert_eq!(median.sample_size, 2);

        let p90 = metric(&rollups, week, P90_HOURS_TO_MERGE).unwrap();
        assert!((p90.value - 19.0).abs() < f64::EPSILON);

        let backend = metric(&rollups, week, "category:backend").unwrap();
        assert!((backend.value - 2.0).abs() < f64::EPSILON);

        let added = metric(&rollups, week, LINES_ADDED).unwrap();
        assert!((added.value - 30.0).abs() < f64::EPSILON);

        // No merges in the second week, so no duration metrics there.
        assert!(metric(&rollups, "2024-03-11T00:00:00Z", MEDIAN_HOURS_TO_MERGE).is_none());
        assert!(metric(&rollups, "2024-03-11T00:00:00Z", PR_COUNT).is_some());
    }

    #[test]
    fn review_latency_uses_earliest_review() {
        let mut r = record(1, "2024-03-04T00:00:00Z", None, None);
        r.change.reviews = vec![
            ReviewEvent {
                reviewer: None,
                state: "APPROVED".into(),
                submitted_at: ts("2024-03-04T08:00:00Z"),
            },
            ReviewEvent {
                reviewer: None,
                state: "COMMENTED".into(),
                submitted_at: ts("2024-03-04T02:00:00Z"),
            },
        ];
        let rollups = compute_rollups(TeamId(1), Bucketing::Day, &[r]);
        let latency = metric(&rollups, "2024-03-04T00:00:00Z", MEDIAN_HOURS_TO_FIRST_REVIEW).unwrap();
        assert!((latency.value - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unclassified_buckets_have_no_ai_rate() {
        let rollups = compute_rollups(
            TeamId(1),
            Bucketing::Day,
            &[record(1, "2024-03-04T00:00:00Z", None, None)],
        );
        assert!(metric(&rollups, "2024-03-04T00:00:00Z", AI_ASSISTED_RATE).is_none());
        let classified = metric(&rollups, "2024-03-04T00:00:00Z", CLASSIFIED_COUNT).unwrap();
        assert!(classified.value.abs() < f64::EPSILON);
    }

    #[test]
    fn output_is_sorted() {
        let records = vec![
            record(1, "2024-04-01T00:00:00Z", None, Some(true)),
            record(2, "2024-03-01T00:00:00Z", Some("2024-03-02T00:00:00Z"), None),
        ];
        let rollups = compute_rollups(TeamId(1), Bucketing::Month, &records);
        let keys: Vec<_> = rollups
            .iter()
            .map(|r| (r.bucket_start, r.metric.clone()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn percentile_interpolates() {
        assert!((percentile(&[1.0], 0.9) - 1.0).abs() < f64::EPSILON);
        assert!((percentile(&[1.0, 2.0, 3.0, 4.0], 0.5) - 2.5).abs() < f64::EPSILON);
        assert!((percentile(&[0.0, 10.0], 0.9) - 9.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn recompute_replaces_previous_rollups() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let team = store.ensure_team("core").await.unwrap();
        let resource = store.track_resource(team, "acme", "api").await.unwrap();
        store
            .upsert_change(resource, &record(1, "2024-03-04T00:00:00Z", None, None).change, None)
            .await
            .unwrap();

        let engine = AggregationEngine::new(store.clone());
        let first = engine.recompute(team, Bucketing::Week).await.unwrap();
        assert_eq!(first.records, 1);
        assert_eq!(first.buckets, 1);
        let before = store.get_rollups(team, Bucketing::Week).await.unwrap();

        // No new data: identical rows.
        engine.recompute(team, Bucketing::Week).await.unwrap();
        assert_eq!(store.get_rollups(team, Bucketing::Week).await.unwrap(), before);

        store
            .upsert_change(resource, &record(2, "2024-03-20T00:00:00Z", None, None).change, None)
            .await
            .unwrap();
        let second = engine.recompute(team, Bucketing::Week).await.unwrap();
        assert_eq!(second.buckets, 2);
        let after = store.get_rollups(team, Bucketing::Week).await.unwrap();
        assert_eq!(after.len(), second.rollups);
    }

    fn arb_record() -> impl Strategy<Value = ChangeRecord> {
        (
            1i64..10_000,
            0i64..(120 * 24),
            prop::option::of(0i64..(14 * 24)),
            prop::option::of(any::<bool>()),
        )
            .prop_map(|(id, created_hours, merge_after, ai)| {
                let created = ts("2024-01-01T00:00:00Z") + chrono::Duration::hours(created_hours);
                let mut r = record(id, "2024-01-01T00:00:00Z", None, ai);
                r.change.created_at = created;
                if let Some(after) = merge_after {
                    r.change.state = ChangeState::Merged;
                    r.change.merged_at = Some(created + chrono::Duration::hours(after));
                }
                r
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn recompute_is_order_independent(
            records in prop::collection::vec(arb_record(), 0..60),
            bucketing in prop_oneof![Just(Bucketing::Day), Just(Bucketing::Week), Just(Bucketing::Month)],
        ) {
            let forward = compute_rollups(TeamId(1), bucketing, &records);
            let again = compute_rollups(TeamId(1), bucketing, &records);
            prop_assert_eq!(&forward, &again);

            let mut reversed = records.clone();
            reversed.reverse();
            prop_assert_eq!(&forward, &compute_rollups(TeamId(1), bucketing, &reversed));

            // Sample sizes never exceed the bucket's record count.
            for rollup in &forward {
                let in_bucket = records
                    .iter()
                    .filter(|r| bucket_start(bucketing, r.change.created_at) == rollup.bucket_start)
                    .count() as u64;
                prop_assert!(rollup.sample_size <= in_bucket);
            }
        }
    }
}
