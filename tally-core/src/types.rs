use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Typed ID wrappers ──────────────────────────────────────────────

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

typed_id!(TeamId);
typed_id!(ResourceId);
typed_id!(ChangeRecordId);
typed_id!(InsightId);

// ── Teams & resources ──────────────────────────────────────────────

/// The owner of tracked resources. Rollups and insights are computed per team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
}

/// Where a resource sits in its two-phase sync lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    NotStarted,
    /// Recent window, so first results show up fast.
    Quick,
    /// Remaining history, excluding the quick window.
    Deep,
    Complete,
    Failed,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Quick => "quick",
            Self::Deep => "deep",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(Self::NotStarted),
            "quick" => Some(Self::Quick),
            "deep" => Some(Self::Deep),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Phase that follows a successful run of `self`, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Quick => Some(Self::Deep),
            Self::Deep => Some(Self::Complete),
            _ => None,
        }
    }

    /// Whether a page-fetching run can execute in this phase.
    pub fn is_runnable(self) -> bool {
        matches!(self, Self::Quick | Self::Deep)
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One externally hosted repository under sync.
///
/// Progress counters are only ever written by the sync orchestrator, through
/// the store's monotonic counter operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedResource {
    pub id: ResourceId,
    pub team_id: TeamId,
    pub owner: String,
    pub name: String,
    pub sync_phase: SyncPhase,
    /// Phase the current (or failed) run belongs to. Retries re-enter it.
    pub active_phase: Option<SyncPhase>,
    pub last_completed_phase: Option<SyncPhase>,
    /// `None` until the first page of the current phase reports a count.
    pub total_items: Option<u64>,
    pub completed_items: u64,
    pub last_error: Option<String>,
    pub lookback_days: Option<u32>,
    pub run_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl TrackedResource {
    /// `owner/name` slug as used in remote search filters.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn percent(&self) -> Percent {
        Percent::derive(self.completed_items, self.total_items)
    }
}

/// Derived completion percentage. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Percent {
    /// Total not yet measured for the current phase.
    Indeterminate,
    Known(f64),
}

impl Percent {
    #[allow(clippy::cast_precision_loss)]
    pub fn derive(done: u64, total: Option<u64>) -> Self {
        match total {
            None => Self::Indeterminate,
            // Zero matches is a finished measurement, not a stall.
            Some(0) => Self::Known(100.0),
            Some(total) => Self::Known(done.min(total) as f64 * 100.0 / total as f64),
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            Self::Indeterminate => None,
            Self::Known(v) => Some(v),
        }
    }
}

impl std::fmt::Display for Percent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Indeterminate => f.write_str("--"),
            Self::Known(v) => write!(f, "{v:.0}%"),
        }
    }
}

// ── Change records ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeState {
    Open,
    Merged,
    Closed,
}

impl ChangeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Merged => "merged",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "merged" => Some(Self::Merged),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewEvent {
    pub reviewer: Option<String>,
    /// Remote review state, e.g. `APPROVED`, `CHANGES_REQUESTED`, `COMMENTED`.
    pub state: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub additions: u64,
    pub deletions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMeta {
    pub sha: String,
    pub message: String,
    pub authored_at: Option<DateTime<Utc>>,
    pub author: Option<String>,
}

/// AI-assistance and technology signals attached to a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Classification {
    pub is_ai_assisted: bool,
    /// Detected tool names, sorted and deduplicated.
    pub tools: BTreeSet<String>,
    /// `None` for pattern results, which carry no calibrated confidence.
    pub confidence: Option<f64>,
    pub categories: BTreeSet<String>,
}

/// Which tier produced a record's effective classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationSource {
    #[default]
    None,
    Pattern,
    Inference,
}

impl ClassificationSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pattern => "pattern",
            Self::Inference => "inference",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pattern" => Self::Pattern,
            "inference" => Self::Inference,
            _ => Self::None,
        }
    }
}

/// A normalized pull request as fetched from the remote, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub remote_id: String,
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub author: Option<String>,
    pub head_ref: Option<String>,
    pub state: ChangeState,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub additions: u64,
    pub deletions: u64,
    pub reviews: Vec<ReviewEvent>,
    pub files: Vec<FileChange>,
    pub commits: Vec<CommitMeta>,
}

/// A persisted pull request. Unique per `(resource_id, remote_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: ChangeRecordId,
    pub resource_id: ResourceId,
    pub change: RemoteChange,
    pub pattern_classification: Option<Classification>,
    pub inference_classification: Option<Classification>,
    pub classification_source: ClassificationSource,
}

impl ChangeRecord {
    /// Inference output wins, then pattern output, else nothing.
    pub fn effective_classification(&self) -> Option<&Classification> {
        self.inference_classification
            .as_ref()
            .or(self.pattern_classification.as_ref())
    }

    pub fn first_review_at(&self) -> Option<DateTime<Utc>> {
        self.change.reviews.iter().map(|r| r.submitted_at).min()
    }
}

// ── Rollups ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Bucketing {
    Day,
    #[default]
    Week,
    Month,
}

impl Bucketing {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            _ => None,
        }
    }
}

/// A cached, recomputable time-bucketed aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    pub team_id: TeamId,
    pub bucketing: Bucketing,
    pub bucket_start: DateTime<Utc>,
    pub metric: String,
    pub value: f64,
    pub sample_size: u64,
}

// ── Insights ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightPriority {
    Low,
    Medium,
    High,
}

impl InsightPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "high" => Self::High,
            "medium" => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// What a rule hands back before persistence assigns identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightDraft {
    pub category: String,
    pub priority: InsightPriority,
    /// What the insight is about, e.g. a metric name. Part of the dedup key.
    pub subject: String,
    /// Start of the bucket the insight describes. Part of the dedup key.
    pub window_start: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: InsightId,
    pub team_id: TeamId,
    pub rule_id: String,
    pub category: String,
    pub priority: InsightPriority,
    pub subject: String,
    pub window_start: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub is_dismissed: bool,
    pub dismissed_at: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn change(created: &str) -> RemoteChange {
        RemoteChange {
            remote_id: "PR_1".to_string(),
            number: 1,
            title: "Add thing".to_string(),
            body: None,
            author: Some("alice".to_string()),
            head_ref: None,
            state: ChangeState::Open,
            created_at: created.parse().unwrap(),
            updated_at: None,
            merged_at: None,
            additions: 0,
            deletions: 0,
            reviews: Vec::new(),
            files: Vec::new(),
            commits: Vec::new(),
        }
    }

    #[test]
    fn percent_indeterminate_until_total_known() {
        assert_eq!(Percent::derive(0, None), Percent::Indeterminate);
        assert_eq!(Percent::derive(0, Some(0)), Percent::Known(100.0));
        assert_eq!(Percent::derive(27, Some(45)), Percent::Known(60.0));
    }

    #[test]
    fn percent_never_exceeds_hundred() {
        assert_eq!(Percent::derive(50, Some(45)), Percent::Known(100.0));
    }

    #[test]
    fn phase_round_trip_and_transitions() {
        for phase in [
            SyncPhase::NotStarted,
            SyncPhase::Quick,
            SyncPhase::Deep,
            SyncPhase::Complete,
            SyncPhase::Failed,
        ] {
            assert_eq!(SyncPhase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(SyncPhase::Quick.next(), Some(SyncPhase::Deep));
        assert_eq!(SyncPhase::Deep.next(), Some(SyncPhase::Complete));
        assert_eq!(SyncPhase::Complete.next(), None);
        assert!(!SyncPhase::Failed.is_runnable());
    }

    #[test]
    fn effective_classification_prefers_inference() {
        let pattern = Classification {
            is_ai_assisted: false,
            ..Classification::default()
        };
        let inference = Classification {
            is_ai_assisted: true,
            confidence: Some(0.9),
            ..Classification::default()
        };
        let mut record = ChangeRecord {
            id: ChangeRecordId(1),
            resource_id: ResourceId(1),
            change: change("2024-03-01T00:00:00Z"),
            pattern_classification: Some(pattern.clone()),
            inference_classification: None,
            classification_source: ClassificationSource::Pattern,
        };
        assert_eq!(record.effective_classification(), Some(&pattern));

        record.inference_classification = Some(inference.clone());
        assert_eq!(record.effective_classification(), Some(&inference));

        record.pattern_classification = None;
        record.inference_classification = None;
        assert!(record.effective_classification().is_none());
    }

    #[test]
    fn first_review_is_earliest() {
        let mut c = change("2024-03-01T00:00:00Z");
        c.reviews = vec![
            ReviewEvent {
                reviewer: Some("bob".into()),
                state: "COMMENTED".into(),
                submitted_at: "2024-03-03T00:00:00Z".parse().unwrap(),
            },
            ReviewEvent {
                reviewer: Some("carol".into()),
                state: "APPROVED".into(),
                submitted_at: "2024-03-02T00:00:00Z".parse().unwrap(),
            },
        ];
        let record = ChangeRecord {
            id: ChangeRecordId(1),
            resource_id: ResourceId(1),
            change: c,
            pattern_classification: None,
            inference_classification: None,
            classification_source: ClassificationSource::None,
        };
        assert_eq!(
            record.first_review_at(),
            Some("2024-03-02T00:00:00Z".parse().unwrap())
        );
    }

    #[test]
    fn enums_parse_lowercase() {
        assert_eq!(ChangeState::parse("MERGED"), Some(ChangeState::Merged));
        assert_eq!(Bucketing::parse("week"), Some(Bucketing::Week));
        assert_eq!(
            ClassificationSource::parse("inference"),
            ClassificationSource::Inference
        );
        assert_eq!(InsightPriority::parse("high"), InsightPriority::High);
    }
}
