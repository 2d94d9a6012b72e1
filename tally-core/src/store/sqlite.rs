use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::de::DeserializeOwned;

use crate::error::StoreError;
use crate::types::{
    Bucketing, ChangeRecord, ChangeRecordId, ChangeState, Classification, ClassificationSource,
    Insight, InsightDraft, InsightId, InsightPriority, RemoteChange, ResourceId, Rollup, SyncPhase,
    Team, TeamId, TrackedResource,
};

use super::SyncStore;
use super::schema;

const CHANGE_COLUMNS: &str = "c.id, c.resource_id, c.remote_id, c.number, c.title, c.body, \
     c.author, c.head_ref, c.state, c.created_at, c.updated_at, c.merged_at, c.additions, \
     c.deletions, c.reviews, c.files, c.commits, c.pattern_classification, \
     c.inference_classification, c.classification_source";

/// SQLite-backed implementation of `SyncStore`.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: &Path) -> crate::error::Result<Self> {
        let conn = Connection::open(path).map_err(StoreError::Sqlite)?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> crate::error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::Sqlite)?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: None,
        };
        store.initialize()?;
        Ok(store)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves SQLite consistent; keep serving.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn initialize(&self) -> crate::error::Result<()> {
        let conn = self.lock();

        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(StoreError::Sqlite)?;

        // WAL mode; ignored for in-memory
        if self.db_path.is_some() {
            let _ = conn.execute_batch(schema::PRAGMAS_SQL);
        }

        conn.execute_batch(schema::SCHEMA_SQL)
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        conn.execute(
            "INSERT OR IGNORE INTO tally_meta (key, value) VALUES ('schema_version', ?1)",
            params![schema::SCHEMA_VERSION],
        )
        .map_err(StoreError::Sqlite)?;

        Ok(())
    }

    fn row_to_resource(row: &Row<'_>) -> rusqlite::Result<TrackedResource> {
        let phase: String = row.get("sync_phase")?;
        let active_phase: Option<String> = row.get("active_phase")?;
        let last_completed: Option<String> = row.get("last_completed_phase")?;
        let total: Option<i64> = row.get("total_items")?;
        let lookback: Option<i64> = row.get("lookback_days")?;

        Ok(TrackedResource {
            id: ResourceId(row.get("id")?),
            team_id: TeamId(row.get("team_id")?),
            owner: row.get("owner")?,
            name: row.get("name")?,
            sync_phase: SyncPhase::parse(&phase).unwrap_or_default(),
            active_phase: active_phase.as_deref().and_then(SyncPhase::parse),
            last_completed_phase: last_completed.as_deref().and_then(SyncPhase::parse),
            total_items: total.map(from_sql_int),
            completed_items: from_sql_int(row.get("completed_items")?),
            last_error: row.get("last_error")?,
            lookback_days: lookback.and_then(|d| u32::try_from(d).ok()),
            run_id: row.get("run_id")?,
            started_at: get_opt_ts(row, "started_at")?,
            completed_at: get_opt_ts(row, "completed_at")?,
            active: row.get::<_, i64>("active")? != 0,
        })
    }

    fn row_to_change(row: &Row<'_>) -> rusqlite::Result<ChangeRecord> {
        let state: String = row.get("state")?;
        let source: String = row.get("classification_source")?;

        let change = RemoteChange {
            remote_id: row.get("remote_id")?,
            number: from_sql_int(row.get("number")?),
            title: row.get("title")?,
            body: row.get("body")?,
            author: row.get("author")?,
            head_ref: row.get("head_ref")?,
            state: ChangeState::parse(&state).unwrap_or(ChangeState::Open),
            created_at: get_ts(row, "created_at")?,
            updated_at: get_opt_ts(row, "updated_at")?,
            merged_at: get_opt_ts(row, "merged_at")?,
            additions: from_sql_int(row.get("additions")?),
            deletions: from_sql_int(row.get("deletions")?),
            reviews: get_json(row, "reviews")?,
            files: get_json(row, "files")?,
            commits: get_json(row, "commits")?,
        };

        Ok(ChangeRecord {
            id: ChangeRecordId(row.get("id")?),
            resource_id: ResourceId(row.get("resource_id")?),
            change,
            pattern_classification: get_opt_json(row, "pattern_classification")?,
            inference_classification: get_opt_json(row, "inference_classification")?,
            classification_source: ClassificationSource::parse(&source),
        })
    }

    fn row_to_rollup(row: &Row<'_>) -> rusqlite::Result<Rollup> {
        let bucketing: String = row.get("bucketing")?;
        Ok(Rollup {
            team_id: TeamId(row.get("team_id")?),
            bucketing: Bucketing::parse(&bucketing).unwrap_or_default(),
            bucket_start: get_ts(row, "bucket_start")?,
            metric: row.get("metric")?,
            value: row.get("value")?,
            sample_size: from_sql_int(row.get("sample_size")?),
        })
    }

    fn row_to_insight(row: &Row<'_>) -> rusqlite::Result<Insight> {
        let priority: String = row.get("priority")?;
        Ok(Insight {
            id: InsightId(row.get("id")?),
            team_id: TeamId(row.get("team_id")?),
            rule_id: row.get("rule_id")?,
            category: row.get("category")?,
            priority: InsightPriority::parse(&priority),
            subject: row.get("subject")?,
            window_start: get_ts(row, "window_start")?,
            payload: get_json(row, "payload")?,
            is_dismissed: row.get::<_, i64>("is_dismissed")? != 0,
            dismissed_at: get_opt_ts(row, "dismissed_at")?,
            generated_at: get_ts(row, "generated_at")?,
        })
    }
}

// ── Column helpers ──────────────────────────────────────────────────

/// Canonical timestamp text. Fixed width so lexical order matches time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_sql_int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_sql_int(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn get_ts(row: &Row<'_>, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(0, e))
}

fn get_opt_ts(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(0, e))
    })
    .transpose()
}

fn get_json<T: DeserializeOwned>(row: &Row<'_>, col: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(col)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(0, e))
}

fn get_opt_json<T: DeserializeOwned>(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(0, e)))
        .transpose()
}

#[async_trait::async_trait]
impl SyncStore for SqliteStore {
    // ── Teams ──────────────────────────────────────────────────────

    async fn ensure_team(&self, name: &str) -> crate::error::Result<TeamId> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO teams (name) VALUES (?1)",
            params![name],
        )?;
        let id = conn.query_row(
            "SELECT id FROM teams WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(TeamId(id))
    }

    async fn list_teams(&self) -> crate::error::Result<Vec<Team>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, name FROM teams ORDER BY id")?;
        let teams = stmt
            .query_map([], |row| {
                Ok(Team {
                    id: TeamId(row.get(0)?),
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(teams)
    }

    // ── Resources ──────────────────────────────────────────────────

    async fn track_resource(
        &self,
        team_id: TeamId,
        owner: &str,
        name: &str,
    ) -> crate::error::Result<ResourceId> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO resources (team_id, owner, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(owner, name) DO UPDATE SET
                active = 1,
                team_id = excluded.team_id",
            params![team_id.0, owner, name],
        )?;
        let id = conn.query_row(
            "SELECT id FROM resources WHERE owner = ?1 AND name = ?2",
            params![owner, name],
            |row| row.get(0),
        )?;
        Ok(ResourceId(id))
    }

    async fn get_resource(&self, id: ResourceId) -> crate::error::Result<Option<TrackedResource>> {
        let conn = self.lock();
        let resource = conn
            .query_row(
                "SELECT * FROM resources WHERE id = ?1",
                params![id.0],
                Self::row_to_resource,
            )
            .optional()?;
        Ok(resource)
    }

    async fn find_resource(
        &self,
        owner: &str,
        name: &str,
    ) -> crate::error::Result<Option<TrackedResource>> {
        let conn = self.lock();
        let resource = conn
            .query_row(
                "SELECT * FROM resources WHERE owner = ?1 AND name = ?2",
                params![owner, name],
                Self::row_to_resource,
            )
            .optional()?;
        Ok(resource)
    }

    async fn list_resources(
        &self,
        team_id: Option<TeamId>,
    ) -> crate::error::Result<Vec<TrackedResource>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM resources
             WHERE active = 1 AND (?1 IS NULL OR team_id = ?1)
             ORDER BY id",
        )?;
        let resources = stmt
            .query_map(params![team_id.map(|t| t.0)], Self::row_to_resource)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(resources)
    }

    async fn deactivate_resource(&self, id: ResourceId) -> crate::error::Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE resources SET active = 0 WHERE id = ?1",
            params![id.0],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("resource {id}")).into());
        }
        Ok(())
    }

    // ── Sync progress ──────────────────────────────────────────────

    async fn request_sync(
        &self,
        id: ResourceId,
        lookback_days: Option<u32>,
        run_id: &str,
    ) -> crate::error::Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE resources SET
                sync_phase = 'quick',
                active_phase = 'quick',
                total_items = NULL,
                completed_items = 0,
                last_error = NULL,
                lookback_days = ?2,
                run_id = ?3,
                started_at = ?4,
                completed_at = NULL
             WHERE id = ?1",
            params![id.0, lookback_days, run_id, ts(&Utc::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("resource {id}")).into());
        }
        Ok(())
    }

    async fn begin_phase(&self, id: ResourceId, phase: SyncPhase) -> crate::error::Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE resources SET
                sync_phase = ?2,
                active_phase = ?2,
                total_items = NULL,
                completed_items = 0,
                last_error = NULL
             WHERE id = ?1",
            params![id.0, phase.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("resource {id}")).into());
        }
        Ok(())
    }

    async fn set_total_items(&self, id: ResourceId, total: u64) -> crate::error::Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE resources SET total_items = MAX(?2, completed_items) WHERE id = ?1",
            params![id.0, to_sql_int(total)],
        )?;
        Ok(())
    }

    async fn adjust_total_items(&self, id: ResourceId, delta: i64) -> crate::error::Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE resources
             SET total_items = MAX(COALESCE(total_items, 0) + ?2, completed_items)
             WHERE id = ?1",
            params![id.0, delta],
        )?;
        Ok(())
    }

    async fn increment_completed(&self, id: ResourceId, by: u64) -> crate::error::Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE resources SET completed_items = CASE
                WHEN total_items IS NULL THEN completed_items + ?2
                ELSE MIN(completed_items + ?2, total_items)
             END
             WHERE id = ?1",
            params![id.0, to_sql_int(by)],
        )?;
        Ok(())
    }

    async fn advance_phase(
        &self,
        id: ResourceId,
        from: SyncPhase,
        to: SyncPhase,
    ) -> crate::error::Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE resources SET
                sync_phase = ?3,
                last_completed_phase = ?2,
                active_phase = CASE WHEN ?3 IN ('quick', 'deep') THEN ?3 ELSE NULL END,
                completed_at = CASE WHEN ?3 = 'complete' THEN ?4 ELSE completed_at END
             WHERE id = ?1 AND sync_phase = ?2",
            params![id.0, from.as_str(), to.as_str(), ts(&Utc::now())],
        )?;
        Ok(changed > 0)
    }

    async fn mark_failed(
        &self,
        id: ResourceId,
        phase: SyncPhase,
        error: &str,
    ) -> crate::error::Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE resources SET
                sync_phase = 'failed',
                active_phase = ?2,
                last_error = ?3
             WHERE id = ?1",
            params![id.0, phase.as_str(), error],
        )?;
        Ok(())
    }

    // ── Change records ─────────────────────────────────────────────

    async fn upsert_change(
        &self,
        resource_id: ResourceId,
        change: &RemoteChange,
        pattern: Option<&Classification>,
    ) -> crate::error::Result<ChangeRecordId> {
        let reviews = serde_json::to_string(&change.reviews)?;
        let files = serde_json::to_string(&change.files)?;
        let commits = serde_json::to_string(&change.commits)?;
        let pattern_json = pattern.map(serde_json::to_string).transpose()?;

        let conn = self.lock();
        conn.execute(
            "INSERT INTO change_records (
                resource_id, remote_id, number, title, body, author, head_ref, state,
                created_at, updated_at, merged_at, additions, deletions,
                reviews, files, commits, pattern_classification, classification_source,
                last_synced_at
             ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                CASE WHEN ?17 IS NULL THEN 'none' ELSE 'pattern' END,
                ?18
             )
             ON CONFLICT(resource_id, remote_id) DO UPDATE SET
                number = excluded.number,
                title = excluded.title,
                body = excluded.body,
                author = excluded.author,
                head_ref = excluded.head_ref,
                state = excluded.state,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                merged_at = excluded.merged_at,
                additions = excluded.additions,
                deletions = excluded.deletions,
                reviews = excluded.reviews,
                files = excluded.files,
                commits = excluded.commits,
                pattern_classification = COALESCE(
                    excluded.pattern_classification,
                    change_records.pattern_classification
                ),
                classification_source = CASE
                    WHEN change_records.classification_source = 'inference' THEN 'inference'
                    WHEN COALESCE(
                        excluded.pattern_classification,
                        change_records.pattern_classification
                    ) IS NOT NULL THEN 'pattern'
                    ELSE 'none'
                END,
                last_synced_at = excluded.last_synced_at",
            params![
                resource_id.0,
                change.remote_id,
                to_sql_int(change.number),
                change.title,
                change.body,
                change.author,
                change.head_ref,
                change.state.as_str(),
                ts(&change.created_at),
                change.updated_at.as_ref().map(ts),
                change.merged_at.as_ref().map(ts),
                to_sql_int(change.additions),
                to_sql_int(change.deletions),
                reviews,
                files,
                commits,
                pattern_json,
                ts(&Utc::now()),
            ],
        )?;

        let id = conn.query_row(
            "SELECT id FROM change_records WHERE resource_id = ?1 AND remote_id = ?2",
            params![resource_id.0, change.remote_id],
            |row| row.get(0),
        )?;
        Ok(ChangeRecordId(id))
    }

    async fn get_change(&self, id: ChangeRecordId) -> crate::error::Result<Option<ChangeRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                &format!("SELECT {CHANGE_COLUMNS} FROM change_records c WHERE c.id = ?1"),
                params![id.0],
                Self::row_to_change,
            )
            .optional()?;
        Ok(record)
    }

    async fn changes_for_resource(
        &self,
        resource_id: ResourceId,
    ) -> crate::error::Result<Vec<ChangeRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANGE_COLUMNS} FROM change_records c WHERE c.resource_id = ?1 ORDER BY c.id"
        ))?;
        let records = stmt
            .query_map(params![resource_id.0], Self::row_to_change)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn changes_for_team(&self, team_id: TeamId) -> crate::error::Result<Vec<ChangeRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANGE_COLUMNS} FROM change_records c
             JOIN resources r ON r.id = c.resource_id
             WHERE r.team_id = ?1 AND r.active = 1
             ORDER BY c.id"
        ))?;
        let records = stmt
            .query_map(params![team_id.0], Self::row_to_change)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn count_changes(&self, resource_id: ResourceId) -> crate::error::Result<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM change_records WHERE resource_id = ?1",
            params![resource_id.0],
            |row| row.get(0),
        )?;
        Ok(from_sql_int(count))
    }

    async fn changes_pending_inference(
        &self,
        team_id: TeamId,
        after: Option<ChangeRecordId>,
        limit: usize,
    ) -> crate::error::Result<Vec<ChangeRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANGE_COLUMNS} FROM change_records c
             JOIN resources r ON r.id = c.resource_id
             WHERE r.team_id = ?1
               AND r.active = 1
               AND c.classification_source != 'inference'
               AND c.id > ?2
             ORDER BY c.id
             LIMIT ?3"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = stmt
            .query_map(
                params![team_id.0, after.map_or(0, |a| a.0), limit],
                Self::row_to_change,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn store_inference(
        &self,
        id: ChangeRecordId,
        classification: &Classification,
    ) -> crate::error::Result<bool> {
        let json = serde_json::to_string(classification)?;
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE change_records SET
                inference_classification = ?2,
                classification_source = 'inference',
                enriched_at = ?3
             WHERE id = ?1",
            params![id.0, json, ts(&Utc::now())],
        )?;
        Ok(changed > 0)
    }

    // ── Rollups ────────────────────────────────────────────────────

    async fn replace_rollups(
        &self,
        team_id: TeamId,
        bucketing: Bucketing,
        rollups: &[Rollup],
    ) -> crate::error::Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM rollups WHERE team_id = ?1 AND bucketing = ?2",
            params![team_id.0, bucketing.as_str()],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO rollups (team_id, bucketing, bucket_start, metric, value, sample_size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for rollup in rollups {
                stmt.execute(params![
                    team_id.0,
                    bucketing.as_str(),
                    ts(&rollup.bucket_start),
                    rollup.metric,
                    rollup.value,
                    to_sql_int(rollup.sample_size),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_rollups(
        &self,
        team_id: TeamId,
        bucketing: Bucketing,
    ) -> crate::error::Result<Vec<Rollup>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM rollups
             WHERE team_id = ?1 AND bucketing = ?2
             ORDER BY bucket_start, metric",
        )?;
        let rollups = stmt
            .query_map(params![team_id.0, bucketing.as_str()], Self::row_to_rollup)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rollups)
    }

    // ── Insights ───────────────────────────────────────────────────

    async fn insert_insight(
        &self,
        team_id: TeamId,
        rule_id: &str,
        draft: &InsightDraft,
        generated_at: DateTime<Utc>,
    ) -> crate::error::Result<Option<InsightId>> {
        let payload = serde_json::to_string(&draft.payload)?;
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO insights (
                team_id, rule_id, category, priority, subject, window_start, payload, generated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                team_id.0,
                rule_id,
                draft.category,
                draft.priority.as_str(),
                draft.subject,
                ts(&draft.window_start),
                payload,
                ts(&generated_at),
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(InsightId(conn.last_insert_rowid())))
    }

    async fn list_insights(
        &self,
        team_id: TeamId,
        include_dismissed: bool,
    ) -> crate::error::Result<Vec<Insight>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM insights
             WHERE team_id = ?1 AND (?2 OR is_dismissed = 0)
             ORDER BY id",
        )?;
        let insights = stmt
            .query_map(params![team_id.0, include_dismissed], Self::row_to_insight)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(insights)
    }

    async fn dismiss_insight(
        &self,
        id: InsightId,
        at: DateTime<Utc>,
    ) -> crate::error::Result<bool> {
        let conn = self.lock();
        let exists = conn
            .query_row(
                "SELECT 1 FROM insights WHERE id = ?1",
                params![id.0],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            return Err(StoreError::NotFound(format!("insight {id}")).into());
        }
        let changed = conn.execute(
            "UPDATE insights SET is_dismissed = 1, dismissed_at = ?2
             WHERE id = ?1 AND is_dismissed = 0",
            params![id.0, ts(&at)],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_change(remote_id: &str, created: &str) -> RemoteChange {
        RemoteChange {
            remote_id: remote_id.to_string(),
            number: 7,
            title: "Add retry to client".to_string(),
            body: Some("Adds bounded retry.".to_string()),
            author: Some("alice".to_string()),
            head_ref: Some("feature/retry".to_string()),
            state: ChangeState::Open,
            created_at: created.parse().unwrap(),
            updated_at: None,
            merged_at: None,
            additions: 12,
            deletions: 3,
            reviews: Vec::new(),
            files: vec![crate::types::FileChange {
                path: "src/client.rs".to_string(),
                additions: 12,
                deletions: 3,
            }],
            commits: Vec::new(),
        }
    }

    async fn setup() -> (SqliteStore, TeamId, ResourceId) {
        let store = SqliteStore::in_memory().unwrap();
        let team = store.ensure_team("platform").await.unwrap();
        let resource = store.track_resource(team, "acme", "api").await.unwrap();
        (store, team, resource)
    }

    #[tokio::test]
    async fn ensure_team_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store.ensure_team("platform").await.unwrap();
        let b = store.ensure_team("platform").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list_teams().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_resource_starts_not_started() {
        let (store, team, id) = setup().await;
        let resource = store.get_resource(id).await.unwrap().unwrap();
        assert_eq!(resource.team_id, team);
        assert_eq!(resource.sync_phase, SyncPhase::NotStarted);
        assert_eq!(resource.total_items, None);
        assert_eq!(resource.completed_items, 0);
        assert!(resource.active);
        assert_eq!(resource.slug(), "acme/api");
    }

    #[tokio::test]
    async fn deactivate_hides_but_keeps_resource() {
        let (store, team, id) = setup().await;
        store.deactivate_resource(id).await.unwrap();
        assert!(store.list_resources(Some(team)).await.unwrap().is_empty());
        let resource = store.get_resource(id).await.unwrap().unwrap();
        assert!(!resource.active);

        // Tracking again reactivates the same row.
        let again = store.track_resource(team, "acme", "api").await.unwrap();
        assert_eq!(again, id);
        assert_eq!(store.list_resources(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_change_is_idempotent() {
        let (store, _, resource) = setup().await;
        let change = make_change("PR_kwDO1", "2024-03-01T10:00:00Z");
        let a = store.upsert_change(resource, &change, None).await.unwrap();
        let b = store.upsert_change(resource, &change, None).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.count_changes(resource).await.unwrap(), 1);

        let record = store.get_change(a).await.unwrap().unwrap();
        assert_eq!(record.change, change);
        assert_eq!(record.classification_source, ClassificationSource::None);
    }

    #[tokio::test]
    async fn pattern_never_downgrades_inference() {
        let (store, _, resource) = setup().await;
        let change = make_change("PR_1", "2024-03-01T10:00:00Z");
        let pattern = Classification {
            is_ai_assisted: false,
            ..Classification::default()
        };
        let id = store
            .upsert_change(resource, &change, Some(&pattern))
            .await
            .unwrap();
        assert_eq!(
            store.get_change(id).await.unwrap().unwrap().classification_source,
            ClassificationSource::Pattern
        );

        let inferred = Classification {
            is_ai_assisted: true,
            confidence: Some(0.8),
            ..Classification::default()
        };
        assert!(store.store_inference(id, &inferred).await.unwrap());

        store
            .upsert_change(resource, &change, Some(&pattern))
            .await
            .unwrap();
        let record = store.get_change(id).await.unwrap().unwrap();
        assert_eq!(record.classification_source, ClassificationSource::Inference);
        assert_eq!(record.inference_classification, Some(inferred.clone()));
        assert_eq!(record.effective_classification(), Some(&inferred));
    }

    #[tokio::test]
    async fn counters_clamp_to_total() {
        let (store, _, id) = setup().await;
        store.request_sync(id, None, "run-1").await.unwrap();
        store.set_total_items(id, 3).await.unwrap();
        store.increment_completed(id, 2).await.unwrap();
        store.increment_completed(id, 5).await.unwrap();

        let r = store.get_resource(id).await.unwrap().unwrap();
        assert_eq!(r.total_items, Some(3));
        assert_eq!(r.completed_items, 3);

        // A smaller total never drops below what is already done.
        store.set_total_items(id, 1).await.unwrap();
        let r = store.get_resource(id).await.unwrap().unwrap();
        assert_eq!(r.total_items, Some(3));

        store.adjust_total_items(id, 4).await.unwrap();
        let r = store.get_resource(id).await.unwrap().unwrap();
        assert_eq!(r.total_items, Some(7));
    }

    #[tokio::test]
    async fn advance_phase_is_guarded_by_current_phase() {
        let (store, _, id) = setup().await;
        store.request_sync(id, Some(120), "run-1").await.unwrap();

        assert!(
            !store
                .advance_phase(id, SyncPhase::Deep, SyncPhase::Complete)
                .await
                .unwrap()
        );
        assert!(
            store
                .advance_phase(id, SyncPhase::Quick, SyncPhase::Deep)
                .await
                .unwrap()
        );
        let r = store.get_resource(id).await.unwrap().unwrap();
        assert_eq!(r.sync_phase, SyncPhase::Deep);
        assert_eq!(r.active_phase, Some(SyncPhase::Deep));
        assert_eq!(r.last_completed_phase, Some(SyncPhase::Quick));
        assert_eq!(r.lookback_days, Some(120));

        store
            .advance_phase(id, SyncPhase::Deep, SyncPhase::Complete)
            .await
            .unwrap();
        let r = store.get_resource(id).await.unwrap().unwrap();
        assert_eq!(r.sync_phase, SyncPhase::Complete);
        assert_eq!(r.active_phase, None);
        assert!(r.completed_at.is_some());
    }

    #[tokio::test]
    async fn mark_failed_keeps_phase_for_retry() {
        let (store, _, id) = setup().await;
        store.request_sync(id, None, "run-1").await.unwrap();
        store.begin_phase(id, SyncPhase::Deep).await.unwrap();
        store
            .mark_failed(id, SyncPhase::Deep, "auth expired")
            .await
            .unwrap();
        let r = store.get_resource(id).await.unwrap().unwrap();
        assert_eq!(r.sync_phase, SyncPhase::Failed);
        assert_eq!(r.active_phase, Some(SyncPhase::Deep));
        assert_eq!(r.last_error.as_deref(), Some("auth expired"));
    }

    #[tokio::test]
    async fn pending_inference_pages_by_id() {
        let (store, team, resource) = setup().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let change = make_change(&format!("PR_{i}"), "2024-03-01T10:00:00Z");
            ids.push(store.upsert_change(resource, &change, None).await.unwrap());
        }
        store
            .store_inference(ids[1], &Classification::default())
            .await
            .unwrap();

        let first = store
            .changes_pending_inference(team, None, 2)
            .await
            .unwrap();
        let first_ids: Vec<_> = first.iter().map(|r| r.id).collect();
        assert_eq!(first_ids, vec![ids[0], ids[2]]);

        let rest = store
            .changes_pending_inference(team, Some(ids[2]), 10)
            .await
            .unwrap();
        let rest_ids: Vec<_> = rest.iter().map(|r| r.id).collect();
        assert_eq!(rest_ids, vec![ids[3], ids[4]]);
    }

    #[tokio::test]
    async fn replace_rollups_swaps_whole_set() {
        let (store, team, _) = setup().await;
        let bucket: DateTime<Utc> = "2024-03-04T00:00:00Z".parse().unwrap();
        let make = |metric: &str, value: f64| Rollup {
            team_id: team,
            bucketing: Bucketing::Week,
            bucket_start: bucket,
            metric: metric.to_string(),
            value,
            sample_size: 2,
        };

        store
            .replace_rollups(team, Bucketing::Week, &[make("pr_count", 2.0), make("old", 1.0)])
            .await
            .unwrap();
        store
            .replace_rollups(team, Bucketing::Week, &[make("pr_count", 3.0)])
            .await
            .unwrap();

        let rollups = store.get_rollups(team, Bucketing::Week).await.unwrap();
        assert_eq!(rollups, vec![make("pr_count", 3.0)]);
        assert!(store.get_rollups(team, Bucketing::Day).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insight_dedup_and_dismissal() {
        let (store, team, _) = setup().await;
        let draft = InsightDraft {
            category: "velocity".to_string(),
            priority: InsightPriority::High,
            subject: "median_hours_to_merge".to_string(),
            window_start: "2024-03-04T00:00:00Z".parse().unwrap(),
            payload: serde_json::json!({"ratio": 2.0}),
        };

        let first = store
            .insert_insight(team, "merge-time-regression", &draft, Utc::now())
            .await
            .unwrap();
        let second = store
            .insert_insight(team, "merge-time-regression", &draft, Utc::now())
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        let id = first.unwrap();
        assert!(store.dismiss_insight(id, Utc::now()).await.unwrap());
        assert!(!store.dismiss_insight(id, Utc::now()).await.unwrap());

        assert!(store.list_insights(team, false).await.unwrap().is_empty());
        let all = store.list_insights(team, true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_dismissed);
        assert!(all[0].dismissed_at.is_some());
        assert_eq!(all[0].payload, serde_json::json!({"ratio": 2.0}));
    }

    #[tokio::test]
    async fn dismiss_unknown_insight_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .dismiss_insight(InsightId(99), Utc::now())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Not found"));
    }

    #[tokio::test]
    async fn open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.ensure_team("platform").await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.db_path(), Some(path.as_path()));
        assert_eq!(store.list_teams().await.unwrap().len(), 1);
    }
}
