use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use tally_core::store::SyncStore;

#[derive(Args, Debug)]
pub struct TrackArgs {
    /// Repository as OWNER/NAME or a GitHub URL
    pub repo: String,

    /// Team that owns the repository
    #[arg(long)]
    pub team: Option<String>,

    /// Stop tracking instead (history is kept)
    #[arg(long, conflicts_with = "team")]
    pub remove: bool,

    /// Initialized directory (default: current directory)
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
}

pub async fn run(args: TrackArgs) -> anyhow::Result<()> {
    let workspace = super::Workspace::open(&args.path)?;
    let store = workspace.store()?;

    if args.remove {
        let resource = super::resolve_resource(store.as_ref(), &args.repo).await?;
        store
            .deactivate_resource(resource.id)
            .await
            .context("Failed to deactivate repository")?;
        println!("Stopped tracking {}", resource.slug());
        return Ok(());
    }

    let Some(team_name) = args.team.as_deref() else {
        anyhow::bail!("--team is required when tracking a repository");
    };
    let (owner, name) = super::parse_slug(&args.repo)?;
    let team = store.ensure_team(team_name).await?;
    let id = store
        .track_resource(team, &owner, &name)
        .await
        .context("Failed to track repository")?;
    println!("Tracking {owner}/{name} for team {team_name} (id {id})");
    Ok(())
}
