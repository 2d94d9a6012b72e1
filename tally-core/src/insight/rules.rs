// Built-in insight rules. Each compares the latest bucket with its baseline.

use serde_json::json;

use super::{InsightRule, RuleContext};
use crate::aggregate::{
    AI_ASSISTED_RATE, LINES_ADDED, LINES_REMOVED, MEDIAN_HOURS_TO_FIRST_REVIEW,
    MEDIAN_HOURS_TO_MERGE, PR_COUNT,
};
use crate::config::InsightsSection;
use crate::error::TallyError;
use crate::types::{InsightDraft, InsightPriority};

/// The default rule registry.
pub fn default_rules(config: &InsightsSection) -> Vec<Box<dyn InsightRule>> {
    vec![
        Box::new(AiAdoptionShift {
            min_sample: config.min_sample_size,
            shift: config.ai_rate_shift,
        }),
        Box::new(DurationRegression {
            id: "merge-time-regression",
            metric: MEDIAN_HOURS_TO_MERGE,
            priority: InsightPriority::High,
            min_sample: config.min_sample_size,
            ratio: config.regression_ratio,
        }),
        Box::new(DurationRegression {
            id: "review-latency-regression",
            metric: MEDIAN_HOURS_TO_FIRST_REVIEW,
            priority: InsightPriority::Medium,
            min_sample: config.min_sample_size,
            ratio: config.regression_ratio,
        }),
        Box::new(ThroughputDrop {
            min_sample: config.min_sample_size,
            drop: config.throughput_drop,
        }),
        Box::new(LargeChangeTrend {
            min_sample: config.min_sample_size,
            threshold_lines: config.large_change_lines,
        }),
    ]
}

fn draft(
    rule: &dyn InsightRule,
    ctx: &RuleContext,
    priority: InsightPriority,
    subject: &str,
    payload: serde_json::Value,
) -> InsightDraft {
    InsightDraft {
        category: rule.category().to_string(),
        priority,
        subject: subject.to_string(),
        window_start: ctx.current.start,
        payload,
    }
}

fn finite(rule: &str, metric: &str, value: f64) -> crate::error::Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TallyError::Rule {
            rule: rule.to_string(),
            message: format!("{metric} is not a finite number"),
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ── AI adoption ────────────────────────────────────────────────────

/// AI-assisted share moved by at least `shift` against the baseline.
#[derive(Debug)]
struct AiAdoptionShift {
    min_sample: u64,
    shift: f64,
}

impl InsightRule for AiAdoptionShift {
    fn id(&self) -> &'static str {
        "ai-adoption-shift"
    }

    fn category(&self) -> &'static str {
        "adoption"
    }

    fn evaluate(&self, ctx: &RuleContext) -> crate::error::Result<Option<InsightDraft>> {
        let Some(current) = ctx.current.value(AI_ASSISTED_RATE) else {
            return Ok(None);
        };
        if ctx.current.sample(AI_ASSISTED_RATE) < self.min_sample {
            return Ok(None);
        }
        let Some(baseline) = ctx.baseline_mean(AI_ASSISTED_RATE) else {
            return Ok(None);
        };
        let delta = finite(self.id(), AI_ASSISTED_RATE, current - baseline)?;
        if delta.abs() < self.shift {
            return Ok(None);
        }

        let direction = if delta > 0.0 { "up" } else { "down" };
        let priority = if delta.abs() >= self.shift * 2.0 {
            InsightPriority::High
        } else {
            InsightPriority::Medium
        };
        Ok(Some(draft(
            self,
            ctx,
            priority,
            AI_ASSISTED_RATE,
            json!({
                "direction": direction,
                "current": round2(current),
                "baseline": round2(baseline),
                "delta": round2(delta),
                "sample_size": ctx.current.sample(AI_ASSISTED_RATE),
            }),
        )))
    }
}

// ── Duration regressions ───────────────────────────────────────────

/// A median duration grew to at least `ratio` times its baseline.
#[derive(Debug)]
struct DurationRegression {
    id: &'static str,
    metric: &'static str,
    priority: InsightPriority,
    min_sample: u64,
    ratio: f64,
}

impl InsightRule for DurationRegression {
    fn id(&self) -> &'static str {
        self.id
    }

    fn category(&self) -> &'static str {
        "velocity"
    }

    fn evaluate(&self, ctx: &RuleContext) -> crate::error::Result<Option<InsightDraft>> {
        let Some(current) = ctx.current.value(self.metric) else {
            return Ok(None);
        };
        if ctx.current.sample(self.metric) < self.min_sample {
            return Ok(None);
        }
        let Some(baseline) = ctx.baseline_mean(self.metric).filter(|b| *b > 0.0) else {
            return Ok(None);
        };
        let ratio = finite(self.id, self.metric, current / baseline)?;
        if ratio < self.ratio {
            return Ok(None);
        }

        Ok(Some(draft(
            self,
            ctx,
            self.priority,
            self.metric,
            json!({
                "current_hours": round2(current),
                "baseline_hours": round2(baseline),
                "ratio": round2(ratio),
                "sample_size": ctx.current.sample(self.metric),
            }),
        )))
    }
}

// ── Throughput ─────────────────────────────────────────────────────

/// PR count fell by at least `drop` (a fraction) against the baseline.
#[derive(Debug)]
struct ThroughputDrop {
    min_sample: u64,
    drop: f64,
}

impl InsightRule for ThroughputDrop {
    fn id(&self) -> &'static str {
        "throughput-drop"
    }

    fn category(&self) -> &'static str {
        "velocity"
    }

    #[allow(clippy::cast_precision_loss)]
    fn evaluate(&self, ctx: &RuleContext) -> crate::error::Result<Option<InsightDraft>> {
        let Some(baseline) = ctx.baseline_mean(PR_COUNT) else {
            return Ok(None);
        };
        if baseline < self.min_sample as f64 {
            return Ok(None);
        }
        let current = ctx.current.value(PR_COUNT).unwrap_or(0.0);
        let fall = finite(self.id(), PR_COUNT, 1.0 - current / baseline)?;
        if fall < self.drop {
            return Ok(None);
        }

        Ok(Some(draft(
            self,
            ctx,
            InsightPriority::Medium,
            PR_COUNT,
            json!({
                "current": current,
                "baseline": round2(baseline),
                "drop": round2(fall),
            }),
        )))
    }
}

// ── Change size ────────────────────────────────────────────────────

/// Mean changed lines per PR is above `threshold_lines` and above the baseline.
#[derive(Debug)]
struct LargeChangeTrend {
    min_sample: u64,
    threshold_lines: f64,
}

impl LargeChangeTrend {
    fn mean_lines(view: &super::BucketView) -> Option<f64> {
        let count = view.value(PR_COUNT).filter(|c| *c > 0.0)?;
        let lines = view.value(LINES_ADDED).unwrap_or(0.0) + view.value(LINES_REMOVED).unwrap_or(0.0);
        Some(lines / count)
    }
}

impl InsightRule for LargeChangeTrend {
    fn id(&self) -> &'static str {
        "large-change-trend"
    }

    fn category(&self) -> &'static str {
        "quality"
    }

    #[allow(clippy::cast_precision_loss)]
    fn evaluate(&self, ctx: &RuleContext) -> crate::error::Result<Option<InsightDraft>> {
        if ctx.current.sample(PR_COUNT) < self.min_sample {
            return Ok(None);
        }
        let Some(current) = Self::mean_lines(&ctx.current) else {
            return Ok(None);
        };
        let current = finite(self.id(), "lines_per_pr", current)?;
        if current <= self.threshold_lines {
            return Ok(None);
        }
        let baseline_values: Vec<f64> = ctx.baseline.iter().filter_map(Self::mean_lines).collect();
        let baseline = if baseline_values.is_empty() {
            None
        } else {
            Some(baseline_values.iter().sum::<f64>() / baseline_values.len() as f64)
        };
        if baseline.is_some_and(|b| current <= b) {
            return Ok(None);
        }

        Ok(Some(draft(
            self,
            ctx,
            InsightPriority::Low,
            "lines_per_pr",
            json!({
                "current": round2(current),
                "baseline": baseline.map(round2),
                "threshold": self.threshold_lines,
            }),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bucketing, Rollup, TeamId};

    const WEEKS: [&str; 5] = [
        "2024-01-29T00:00:00Z",
        "2024-02-05T00:00:00Z",
        "2024-02-12T00:00:00Z",
        "2024-02-19T00:00:00Z",
        "2024-02-26T00:00:00Z",
    ];

    /// Four baseline weeks with `baseline`, then the latest week with `current`.
    fn series(metric: &str, baseline: f64, current: f64, sample: u64) -> Vec<Rollup> {
        WEEKS
            .iter()
            .enumerate()
            .map(|(i, start)| Rollup {
                team_id: TeamId(1),
                bucketing: Bucketing::Week,
                bucket_start: start.parse().unwrap(),
                metric: metric.into(),
                value: if i == WEEKS.len() - 1 { current } else { baseline },
                sample_size: sample,
            })
            .collect()
    }

    fn ctx(rollups: &[Rollup]) -> RuleContext {
        ctx_at(rollups, "2024-03-04T00:00:00Z")
    }

    fn ctx_at(rollups: &[Rollup], now: &str) -> RuleContext {
        RuleContext::from_rollups(TeamId(1), Bucketing::Week, rollups, 4, now.parse().unwrap())
            .unwrap()
    }

    fn rule(id: &str) -> Box<dyn InsightRule> {
        default_rules(&InsightsSection::default())
            .into_iter()
            .find(|r| r.id() == id)
            .unwrap()
    }

    #[test]
    fn registry_has_five_unique_rules() {
        let rules = default_rules(&InsightsSection::default());
        let mut ids: Vec<_> = rules.iter().map(|r| r.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn ai_adoption_shift_fires_on_large_move() {
        let draft = rule("ai-adoption-shift")
            .evaluate(&ctx(&series(AI_ASSISTED_RATE, 0.1, 0.5, 10)))
            .unwrap()
            .unwrap();
        assert_eq!(draft.subject, AI_ASSISTED_RATE);
        assert_eq!(draft.priority, InsightPriority::High);
        assert_eq!(draft.payload["direction"], "up");
        assert_eq!(draft.window_start, WEEKS[4].parse::<chrono::DateTime<chrono::Utc>>().unwrap());

        let quiet = rule("ai-adoption-shift")
            .evaluate(&ctx(&series(AI_ASSISTED_RATE, 0.3, 0.35, 10)))
            .unwrap();
        assert!(quiet.is_none());
    }

    #[test]
    fn ai_adoption_needs_sample() {
        let result = rule("ai-adoption-shift")
            .evaluate(&ctx(&series(AI_ASSISTED_RATE, 0.1, 0.9, 1)))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn merge_time_regression() {
        let draft = rule("merge-time-regression")
            .evaluate(&ctx(&series(MEDIAN_HOURS_TO_MERGE, 10.0, 30.0, 5)))
            .unwrap()
            .unwrap();
        assert_eq!(draft.priority, InsightPriority::High);
        assert_eq!(draft.payload["ratio"], 3.0);

        let fine = rule("merge-time-regression")
            .evaluate(&ctx(&series(MEDIAN_HOURS_TO_MERGE, 10.0, 12.0, 5)))
            .unwrap();
        assert!(fine.is_none());
    }

    #[test]
    fn review_latency_regression_without_baseline_is_silent() {
        let only_latest = vec![series(MEDIAN_HOURS_TO_FIRST_REVIEW, 1.0, 50.0, 5).remove(4)];
        let result = rule("review-latency-regression")
            .evaluate(&ctx(&only_latest))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn throughput_drop() {
        let draft = rule("throughput-drop")
            .evaluate(&ctx(&series(PR_COUNT, 20.0, 5.0, 20)))
            .unwrap()
            .unwrap();
        assert_eq!(draft.payload["drop"], 0.75);

        let steady = rule("throughput-drop")
            .evaluate(&ctx(&series(PR_COUNT, 20.0, 18.0, 20)))
            .unwrap();
        assert!(steady.is_none());
    }

    #[test]
    fn throughput_drop_ignores_week_in_progress() {
        let rollups = series(PR_COUNT, 20.0, 2.0, 20);
        let midweek = rule("throughput-drop")
            .evaluate(&ctx_at(&rollups, "2024-02-27T10:00:00Z"))
            .unwrap();
        assert!(midweek.is_none());

        let closed = rule("throughput-drop")
            .evaluate(&ctx_at(&rollups, "2024-03-04T00:00:00Z"))
            .unwrap()
            .unwrap();
        assert_eq!(closed.payload["drop"], 0.9);
    }

    #[test]
    fn large_change_trend() {
        let mut rollups = series(PR_COUNT, 4.0, 4.0, 4);
        rollups.extend(series(LINES_ADDED, 400.0, 4000.0, 4));
        let draft = rule("large-change-trend").evaluate(&ctx(&rollups)).unwrap().unwrap();
        assert_eq!(draft.subject, "lines_per_pr");
        assert_eq!(draft.payload["current"], 1000.0);
        assert_eq!(draft.payload["baseline"], 100.0);
    }

    #[test]
    fn non_finite_value_is_a_rule_error() {
        let result = rule("merge-time-regression")
            .evaluate(&ctx(&series(MEDIAN_HOURS_TO_MERGE, 10.0, f64::INFINITY, 5)));
        assert!(matches!(result, Err(TallyError::Rule { .. })));
    }
}
