use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use tally_core::config::TallyConfig;
use tally_core::store::sqlite::SqliteStore;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Directory to initialize (default: current directory)
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Overwrite an existing config with defaults
    #[arg(long)]
    pub force: bool,
}

#[allow(clippy::unused_async)]
pub async fn run(args: InitArgs) -> anyhow::Result<()> {
    let root = std::fs::canonicalize(&args.path)
        .with_context(|| format!("Cannot resolve path: {}", args.path.display()))?;
    let tally_dir = root.join(super::TALLY_DIR);
    std::fs::create_dir_all(&tally_dir)
        .with_context(|| format!("Cannot create {}", tally_dir.display()))?;

    let config_path = super::config_path(&root);
    if config_path.exists() && !args.force {
        println!("Keeping existing config: {}", config_path.display());
    } else {
        let config = toml::to_string_pretty(&TallyConfig::default())
            .context("Cannot serialize default config")?;
        std::fs::write(&config_path, config)
            .with_context(|| format!("Cannot write config: {}", config_path.display()))?;
        println!("Wrote config: {}", config_path.display());
    }

    let db_path = super::db_path(&root);
    SqliteStore::open(&db_path)
        .with_context(|| format!("Cannot open database: {}", db_path.display()))?;
    println!("Database:     {}", db_path.display());
    println!();
    println!("Tally initialized in {}", root.display());
    println!("Next: tally track OWNER/NAME --team TEAM");
    Ok(())
}
