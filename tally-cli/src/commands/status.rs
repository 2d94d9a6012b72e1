use std::path::PathBuf;

use clap::Args;

use tally_core::progress::SyncStatus;
use tally_core::store::SyncStore;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Repository as OWNER/NAME (default: every tracked repository)
    pub repo: Option<String>,

    /// Emit JSON instead of a table
    #[arg(long)]
    pub json: bool,

    /// Initialized directory (default: current directory)
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
}

pub async fn run(args: StatusArgs) -> anyhow::Result<()> {
    let workspace = super::Workspace::open(&args.path)?;
    let store = workspace.store()?;

    let resources = match &args.repo {
        Some(slug) => vec![super::resolve_resource(store.as_ref(), slug).await?],
        None => store.list_resources(None).await?,
    };
    let statuses: Vec<SyncStatus> = resources.iter().map(SyncStatus::from_resource).collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    if statuses.is_empty() {
        println!("No repositories tracked. Run `tally track OWNER/NAME --team TEAM`.");
        return Ok(());
    }

    println!(
        "  {:<32} {:<12} {:>6} {:>14}",
        "REPOSITORY", "PHASE", "PCT", "ITEMS"
    );
    for status in &statuses {
        let items = match status.items_total {
            Some(total) => format!("{}/{total}", status.items_done),
            None => format!("{}/?", status.items_done),
        };
        println!(
            "  {:<32} {:<12} {:>6} {:>14}",
            status.resource,
            status.phase.as_str(),
            status.percent.to_string(),
            items
        );
        if let Some(error) = &status.error {
            let last = status
                .last_completed_phase
                .map_or("none", |p| p.as_str());
            println!("      error: {error} (last completed phase: {last})");
        }
    }
    Ok(())
}
