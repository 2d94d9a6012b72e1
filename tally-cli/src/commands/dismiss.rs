use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::Args;

use tally_core::store::SyncStore;
use tally_core::types::InsightId;

#[derive(Args, Debug)]
pub struct DismissArgs {
    /// Insight id, as shown by `tally insights`
    pub id: i64,

    /// Initialized directory (default: current directory)
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
}

pub async fn run(args: DismissArgs) -> anyhow::Result<()> {
    let workspace = super::Workspace::open(&args.path)?;
    let store = workspace.store()?;
    let id = InsightId(args.id);

    let dismissed = store
        .dismiss_insight(id, Utc::now())
        .await
        .with_context(|| format!("Cannot dismiss insight {id}"))?;
    if dismissed {
        println!("Dismissed insight {id}");
    } else {
        println!("Insight {id} was already dismissed");
    }
    Ok(())
}
