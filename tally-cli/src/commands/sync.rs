use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use tracing::warn;

use tally_core::enrich::{InferenceProvider, LlmInferenceProvider};
use tally_core::fetch::{GitHubSearchFetcher, RateBudget};
use tally_core::llm::providers::provider_from_config;
use tally_core::pipeline::TallyPipeline;
use tally_core::progress::{IndicatifReporter, ProgressReporter, ProgressTracker};
use tally_core::store::SyncStore;
use tally_core::sync::WorkQueue;
use tally_core::types::SyncPhase;

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Repository as OWNER/NAME
    pub repo: String,

    /// Total history to cover, overriding `sync.lookback_days`
    #[arg(long)]
    pub lookback_days: Option<u32>,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Initialized directory (default: current directory)
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
}

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub async fn run(args: SyncArgs) -> anyhow::Result<()> {
    let workspace = super::Workspace::open(&args.path)?;
    let config = &workspace.config;
    if let Some(days) = args.lookback_days {
        if days <= config.sync.quick_window_days {
            anyhow::bail!(
                "--lookback-days ({days}) must exceed sync.quick_window_days ({}) in config",
                config.sync.quick_window_days
            );
        }
    }

    let store = workspace.store()?;
    let resource = super::resolve_resource(store.as_ref(), &args.repo).await?;

    if std::env::var(&config.github.token_env).is_err() {
        anyhow::bail!(
            "GitHub API token missing: set {} to a token with repo read access",
            config.github.token_env
        );
    }
    let budget = Arc::new(RateBudget::new(config.github.rate_limit_pause_threshold));
    let fetcher = GitHubSearchFetcher::from_config(&config.github, Arc::clone(&budget))
        .context("GitHub API client setup failed")?;
    let inference = inference_provider(&workspace);

    let (queue, receiver) = WorkQueue::new();
    let pipeline = Arc::new(TallyPipeline::new(
        store.clone(),
        Arc::new(fetcher),
        budget,
        inference,
        config,
        queue,
    ));
    let pool = pipeline.start(&receiver, config.sync.workers);
    let sweeps = (config.enrichment.sweep_interval_secs > 0).then(|| {
        pipeline.start_enrichment_timer(Duration::from_secs(config.enrichment.sweep_interval_secs))
    });

    pipeline
        .orchestrator()
        .start_sync(resource.id, args.lookback_days)
        .await
        .context("Failed to start sync")?;

    let reporter: Box<dyn ProgressReporter> = if args.no_progress {
        Box::new(IndicatifReporter::hidden())
    } else {
        Box::new(IndicatifReporter::new())
    };
    let tracker = ProgressTracker::new(store.clone());
    let idle = pipeline.queue().clone();
    let drained = idle.wait_idle();
    tokio::pin!(drained);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            () = &mut drained => break,
            _ = ticker.tick() => {
                if let Ok(status) = tracker.get_status(resource.id).await {
                    reporter.update(&status);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if pipeline.orchestrator().cancel(resource.id) {
                    reporter.message("Cancelling after the current page...");
                }
            }
        }
    }
    reporter.finish();
    if let Some(sweeps) = sweeps {
        sweeps.abort();
    }
    pool.shutdown().await;

    let status = tracker.get_status(resource.id).await?;
    let total = store.count_changes(resource.id).await?;
    println!("{}: {} ({})", status.resource, status.phase, status.percent);
    println!("  Pull requests stored: {total}");
    if let Some(last) = status.last_completed_phase {
        println!("  Last completed phase: {last}");
    }

    match status.phase {
        SyncPhase::Failed => anyhow::bail!(
            "Sync failed for {}: {}",
            status.resource,
            status.error.unwrap_or_default()
        ),
        SyncPhase::Quick | SyncPhase::Deep => {
            println!("  Interrupted; run `tally sync {}` to resume.", status.resource);
            Ok(())
        }
        SyncPhase::NotStarted | SyncPhase::Complete => Ok(()),
    }
}

/// The configured inference provider, or `None` to rely on pattern data only.
fn inference_provider(workspace: &super::Workspace) -> Option<Arc<dyn InferenceProvider>> {
    let llm = &workspace.config.llm;
    if !llm.enabled {
        return None;
    }
    match provider_from_config(llm) {
        Ok(provider) => Some(Arc::new(LlmInferenceProvider::new(provider))),
        Err(e) => {
            warn!(error = %e, "Inference disabled for this run");
            None
        }
    }
}
