use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;

use tally_core::aggregate::AggregationEngine;
use tally_core::enrich::{EnrichmentQueue, LlmInferenceProvider};
use tally_core::llm::providers::provider_from_config;

#[derive(Args, Debug)]
pub struct EnrichArgs {
    /// Team whose records to enrich
    #[arg(long)]
    pub team: String,

    /// Skip the rollup recompute after the sweep
    #[arg(long)]
    pub no_aggregate: bool,

    /// Initialized directory (default: current directory)
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
}

pub async fn run(args: EnrichArgs) -> anyhow::Result<()> {
    let workspace = super::Workspace::open(&args.path)?;
    let config = &workspace.config;
    if !config.llm.enabled {
        anyhow::bail!("Inference is disabled: set [llm] enabled = true in .tally/config.toml");
    }
    let provider = provider_from_config(&config.llm).context("LLM provider setup failed")?;

    let store = workspace.store()?;
    let team = super::resolve_team(store.as_ref(), &args.team).await?;

    let queue = EnrichmentQueue::new(
        store.clone(),
        Arc::new(LlmInferenceProvider::new(provider)),
        config.enrichment.clone(),
        config.llm.cost_budget,
    );
    let stats = queue.sweep(team.id).await.context("Enrichment sweep failed")?;

    println!("Enrichment sweep for team {}", team.name);
    println!("  Selected:         {}", stats.selected);
    println!("  Enriched:         {}", stats.enriched);
    println!("  Not answered:     {}", stats.skipped);
    println!("  Deferred batches: {}", stats.deferred_batches);
    println!("  Cost:             ${:.4}", stats.cost_usd);
    if let Some(halt) = stats.halted {
        println!("  Stopped early:    {}", serde_json::to_string(&halt)?.trim_matches('"'));
    }

    if !args.no_aggregate {
        let recompute = AggregationEngine::new(store)
            .recompute(team.id, config.aggregation.bucketing)
            .await
            .context("Rollup recompute failed")?;
        println!("  Rollups:          {}", recompute.rollups);
    }
    Ok(())
}
