pub mod aggregate;
pub mod dismiss;
pub mod enrich;
pub mod init;
pub mod insights;
pub mod status;
pub mod sync;
pub mod track;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;

use tally_core::config::TallyConfig;
use tally_core::fetch::parse_resource_slug;
use tally_core::store::SyncStore;
use tally_core::store::sqlite::SqliteStore;
use tally_core::types::{Team, TrackedResource};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create .tally/ with a default config and an empty database
    Init(init::InitArgs),
    /// Start (or stop) tracking a repository for a team
    Track(track::TrackArgs),
    /// Sync a repository's pull requests and run the pipeline until idle
    Sync(sync::SyncArgs),
    /// Show sync progress for tracked repositories
    Status(status::StatusArgs),
    /// Run one inference enrichment sweep for a team
    Enrich(enrich::EnrichArgs),
    /// Recompute a team's rollups and evaluate insight rules
    Aggregate(aggregate::AggregateArgs),
    /// List a team's insights
    Insights(insights::InsightsArgs),
    /// Dismiss an insight
    Dismiss(dismiss::DismissArgs),
}

pub async fn run(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Init(args) => init::run(args).await,
        Command::Track(args) => track::run(args).await,
        Command::Sync(args) => sync::run(args).await,
        Command::Status(args) => status::run(args).await,
        Command::Enrich(args) => enrich::run(args).await,
        Command::Aggregate(args) => aggregate::run(args).await,
        Command::Insights(args) => insights::run(args).await,
        Command::Dismiss(args) => dismiss::run(args).await,
    }
}

pub(crate) const TALLY_DIR: &str = ".tally";

pub(crate) fn config_path(root: &Path) -> PathBuf {
    root.join(TALLY_DIR).join("config.toml")
}

pub(crate) fn db_path(root: &Path) -> PathBuf {
    root.join(TALLY_DIR).join("tally.db")
}

/// An initialized `.tally/` directory with its loaded config.
#[derive(Debug)]
pub(crate) struct Workspace {
    pub root: PathBuf,
    pub config: TallyConfig,
}

impl Workspace {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let root = std::fs::canonicalize(path)
            .with_context(|| format!("Cannot resolve path: {}", path.display()))?;
        let config_path = config_path(&root);
        if !config_path.exists() {
            anyhow::bail!(
                "Tally is not initialized in {}. Run `tally init` first.",
                root.display()
            );
        }
        let config = TallyConfig::load(&config_path)
            .with_context(|| format!("Cannot load config: {}", config_path.display()))?;
        Ok(Self { root, config })
    }

    pub fn store(&self) -> anyhow::Result<Arc<SqliteStore>> {
        let path = db_path(&self.root);
        let store = SqliteStore::open(&path)
            .with_context(|| format!("Cannot open database: {}", path.display()))?;
        Ok(Arc::new(store))
    }
}

pub(crate) async fn resolve_team(store: &dyn SyncStore, name: &str) -> anyhow::Result<Team> {
    store
        .list_teams()
        .await?
        .into_iter()
        .find(|t| t.name == name)
        .with_context(|| format!("Unknown team: {name}"))
}

pub(crate) async fn resolve_resource(
    store: &dyn SyncStore,
    slug: &str,
) -> anyhow::Result<TrackedResource> {
    let (owner, name) = parse_slug(slug)?;
    store
        .find_resource(&owner, &name)
        .await?
        .filter(|r| r.active)
        .with_context(|| format!("{owner}/{name} is not tracked. Run `tally track {owner}/{name}` first."))
}

pub(crate) fn parse_slug(slug: &str) -> anyhow::Result<(String, String)> {
    parse_resource_slug(slug)
        .with_context(|| format!("Cannot parse repository '{slug}': expected OWNER/NAME"))
}
