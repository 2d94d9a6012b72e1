use std::path::PathBuf;

use clap::Args;

use tally_core::store::SyncStore;

#[derive(Args, Debug)]
pub struct InsightsArgs {
    /// Team to list
    #[arg(long)]
    pub team: String,

    /// Include dismissed insights
    #[arg(long)]
    pub all: bool,

    /// Emit JSON instead of text
    #[arg(long)]
    pub json: bool,

    /// Initialized directory (default: current directory)
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
}

pub async fn run(args: InsightsArgs) -> anyhow::Result<()> {
    let workspace = super::Workspace::open(&args.path)?;
    let store = workspace.store()?;
    let team = super::resolve_team(store.as_ref(), &args.team).await?;
    let insights = store.list_insights(team.id, args.all).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&insights)?);
        return Ok(());
    }

    if insights.is_empty() {
        println!("No insights for team {}", team.name);
        return Ok(());
    }

    for insight in &insights {
        let dismissed = if insight.is_dismissed { " (dismissed)" } else { "" };
        println!(
            "#{} [{}] {} · {} · bucket {}{dismissed}",
            insight.id,
            insight.priority.as_str(),
            insight.rule_id,
            insight.subject,
            insight.window_start.format("%Y-%m-%d"),
        );
        println!("    {}", insight.payload);
    }
    Ok(())
}
