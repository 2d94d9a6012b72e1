/// Current schema version.
pub const SCHEMA_VERSION: &str = "1";

/// Full SQL schema for Tally's `SQLite` database.
pub const SCHEMA_SQL: &str = r"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS tally_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS teams (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

-- Tracked repositories and their sync progress
CREATE TABLE IF NOT EXISTS resources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id INTEGER NOT NULL REFERENCES teams(id),
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    sync_phase TEXT NOT NULL DEFAULT 'not_started',
    active_phase TEXT,
    last_completed_phase TEXT,
    total_items INTEGER,
    completed_items INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    lookback_days INTEGER,
    run_id TEXT,
    started_at TEXT,
    completed_at TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    UNIQUE(owner, name),
    CHECK (total_items IS NULL OR completed_items <= total_items)
);
CREATE INDEX IF NOT EXISTS idx_resources_team ON resources(team_id);

-- Normalized pull requests
CREATE TABLE IF NOT EXISTS change_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_id INTEGER NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
    remote_id TEXT NOT NULL,
    number INTEGER NOT NULL,
    title TEXT NOT NULL,
    body TEXT,
    author TEXT,
    head_ref TEXT,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT,
    merged_at TEXT,
    additions INTEGER NOT NULL DEFAULT 0,
    deletions INTEGER NOT NULL DEFAULT 0,
    reviews TEXT NOT NULL DEFAULT '[]',
    files TEXT NOT NULL DEFAULT '[]',
    commits TEXT NOT NULL DEFAULT '[]',
    pattern_classification TEXT,
    inference_classification TEXT,
    classification_source TEXT NOT NULL DEFAULT 'none',
    last_synced_at TEXT NOT NULL,
    enriched_at TEXT,
    UNIQUE(resource_id, remote_id)
);
CREATE INDEX IF NOT EXISTS idx_changes_resource ON change_records(resource_id);
CREATE INDEX IF NOT EXISTS idx_changes_source ON change_records(classification_source);
CREATE INDEX IF NOT EXISTS idx_changes_created ON change_records(created_at);

-- Time-bucketed aggregates (a cache, recomputed wholesale)
CREATE TABLE IF NOT EXISTS rollups (
    team_id INTEGER NOT NULL REFERENCES teams(id),
    bucketing TEXT NOT NULL,
    bucket_start TEXT NOT NULL,
    metric TEXT NOT NULL,
    value REAL NOT NULL,
    sample_size INTEGER NOT NULL,
    PRIMARY KEY (team_id, bucketing, bucket_start, metric)
);

-- Rule-derived observations
CREATE TABLE IF NOT EXISTS insights (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id INTEGER NOT NULL REFERENCES teams(id),
    rule_id TEXT NOT NULL,
    category TEXT NOT NULL,
    priority TEXT NOT NULL,
    subject TEXT NOT NULL,
    window_start TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    is_dismissed INTEGER NOT NULL DEFAULT 0,
    dismissed_at TEXT,
    generated_at TEXT NOT NULL,
    UNIQUE(team_id, rule_id, subject, window_start)
);
CREATE INDEX IF NOT EXISTS idx_insights_team ON insights(team_id, is_dismissed);
";

/// `SQLite` PRAGMAs for performance.
pub const PRAGMAS_SQL: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA foreign_keys = ON;
";
