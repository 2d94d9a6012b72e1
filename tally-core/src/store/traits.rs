use chrono::{DateTime, Utc};

use crate::types::{
    Bucketing, ChangeRecord, ChangeRecordId, Classification, Insight, InsightDraft, InsightId,
    RemoteChange, ResourceId, Rollup, SyncPhase, Team, TeamId, TrackedResource,
};

/// The store abstraction. Every pipeline component reads and writes through this trait.
#[async_trait::async_trait]
pub trait SyncStore: Send + Sync {
    // ── Teams ──────────────────────────────────────────────────────

    /// Get or create a team by name.
    async fn ensure_team(&self, name: &str) -> crate::error::Result<TeamId>;

    async fn list_teams(&self) -> crate::error::Result<Vec<Team>>;

    // ── Resources ──────────────────────────────────────────────────

    /// Start tracking `owner/name` for a team. Reactivates an inactive resource.
    async fn track_resource(
        &self,
        team_id: TeamId,
        owner: &str,
        name: &str,
    ) -> crate::error::Result<ResourceId>;

    async fn get_resource(&self, id: ResourceId) -> crate::error::Result<Option<TrackedResource>>;

    async fn find_resource(
        &self,
        owner: &str,
        name: &str,
    ) -> crate::error::Result<Option<TrackedResource>>;

    /// Active resources, optionally restricted to one team.
    async fn list_resources(
        &self,
        team_id: Option<TeamId>,
    ) -> crate::error::Result<Vec<TrackedResource>>;

    /// Mark a resource inactive. Resources are never hard-deleted.
    async fn deactivate_resource(&self, id: ResourceId) -> crate::error::Result<()>;

    // ── Sync progress ──────────────────────────────────────────────

    /// Enter the quick phase for a fresh run, clearing counters and errors.
    async fn request_sync(
        &self,
        id: ResourceId,
        lookback_days: Option<u32>,
        run_id: &str,
    ) -> crate::error::Result<()>;

    /// Enter `phase` for a run: counters reset, total unknown, error cleared.
    async fn begin_phase(&self, id: ResourceId, phase: SyncPhase) -> crate::error::Result<()>;

    /// Record the authoritative total for the current phase. Never drops below `completed_items`.
    async fn set_total_items(&self, id: ResourceId, total: u64) -> crate::error::Result<()>;

    /// Shift the current total by `delta`, clamped to `completed_items`.
    async fn adjust_total_items(&self, id: ResourceId, delta: i64) -> crate::error::Result<()>;

    /// Monotonic counter bump, performed as a single statement and capped at the total.
    async fn increment_completed(&self, id: ResourceId, by: u64) -> crate::error::Result<()>;

    /// Move `from -> to` if the resource is still in `from`. Counters are kept.
    async fn advance_phase(
        &self,
        id: ResourceId,
        from: SyncPhase,
        to: SyncPhase,
    ) -> crate::error::Result<bool>;

    /// Fail the run of `phase`, keeping it as the phase a retry re-enters.
    async fn mark_failed(
        &self,
        id: ResourceId,
        phase: SyncPhase,
        error: &str,
    ) -> crate::error::Result<()>;

    // ── Change records ─────────────────────────────────────────────

    /// Idempotent upsert keyed by `(resource, remote_id)`.
    ///
    /// A `pattern` classification replaces any earlier pattern result but never
    /// downgrades a record whose source is already inference.
    async fn upsert_change(
        &self,
        resource_id: ResourceId,
        change: &RemoteChange,
        pattern: Option<&Classification>,
    ) -> crate::error::Result<ChangeRecordId>;

    async fn get_change(&self, id: ChangeRecordId) -> crate::error::Result<Option<ChangeRecord>>;

    async fn changes_for_resource(
        &self,
        resource_id: ResourceId,
    ) -> crate::error::Result<Vec<ChangeRecord>>;

    /// All records of the team's active resources, ordered by id.
    async fn changes_for_team(&self, team_id: TeamId) -> crate::error::Result<Vec<ChangeRecord>>;

    async fn count_changes(&self, resource_id: ResourceId) -> crate::error::Result<u64>;

    /// Records not yet classified by inference with id greater than `after`, ascending.
    async fn changes_pending_inference(
        &self,
        team_id: TeamId,
        after: Option<ChangeRecordId>,
        limit: usize,
    ) -> crate::error::Result<Vec<ChangeRecord>>;

    /// Store an inference result and flip the source. Returns false if the record is gone.
    async fn store_inference(
        &self,
        id: ChangeRecordId,
        classification: &Classification,
    ) -> crate::error::Result<bool>;

    // ── Rollups ────────────────────────────────────────────────────

    /// Replace every rollup of `(team, bucketing)` in one transaction.
    async fn replace_rollups(
        &self,
        team_id: TeamId,
        bucketing: Bucketing,
        rollups: &[Rollup],
    ) -> crate::error::Result<()>;

    /// Rollups ordered by `(bucket_start, metric)`.
    async fn get_rollups(
        &self,
        team_id: TeamId,
        bucketing: Bucketing,
    ) -> crate::error::Result<Vec<Rollup>>;

    // ── Insights ───────────────────────────────────────────────────

    /// Insert unless an insight already exists for `(team, rule, subject, window)`.
    async fn insert_insight(
        &self,
        team_id: TeamId,
        rule_id: &str,
        draft: &InsightDraft,
        generated_at: DateTime<Utc>,
    ) -> crate::error::Result<Option<InsightId>>;

    async fn list_insights(
        &self,
        team_id: TeamId,
        include_dismissed: bool,
    ) -> crate::error::Result<Vec<Insight>>;

    /// Idempotent. Returns true only for the call that actually dismissed.
    async fn dismiss_insight(
        &self,
        id: InsightId,
        at: DateTime<Utc>,
    ) -> crate::error::Result<bool>;
}
