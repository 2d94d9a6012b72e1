use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use tally_core::aggregate::AggregationEngine;
use tally_core::insight::{InsightEngine, default_rules};
use tally_core::types::Bucketing;

#[derive(Args, Debug)]
pub struct AggregateArgs {
    /// Team to recompute
    #[arg(long)]
    pub team: String,

    /// Bucket size: day, week, month (default: from config)
    #[arg(long)]
    pub bucketing: Option<String>,

    /// Initialized directory (default: current directory)
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
}

pub async fn run(args: AggregateArgs) -> anyhow::Result<()> {
    let workspace = super::Workspace::open(&args.path)?;
    let config = &workspace.config;
    let bucketing = match args.bucketing.as_deref() {
        Some(raw) => Bucketing::parse(raw)
            .with_context(|| format!("Unknown bucketing '{raw}' (expected day, week, month)"))?,
        None => config.aggregation.bucketing,
    };

    let store = workspace.store()?;
    let team = super::resolve_team(store.as_ref(), &args.team).await?;

    let recompute = AggregationEngine::new(store.clone())
        .recompute(team.id, bucketing)
        .await
        .context("Rollup recompute failed")?;
    let insights = InsightEngine::new(
        store,
        default_rules(&config.insights),
        bucketing,
        config.insights.baseline_buckets,
    )
    .evaluate(team.id)
    .await
    .context("Insight evaluation failed")?;

    println!("Aggregated team {} ({})", team.name, bucketing.as_str());
    println!("  Records:      {}", recompute.records);
    println!("  Buckets:      {}", recompute.buckets);
    println!("  Rollups:      {}", recompute.rollups);
    println!("  New insights: {}", insights.generated);
    if !insights.errors.is_empty() {
        println!();
        println!("  Warnings ({}):", insights.errors.len());
        for (rule, error) in &insights.errors {
            println!("    - {rule}: {error}");
        }
    }
    Ok(())
}
