use clap::Parser;

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "tally",
    version,
    about = "Sync pull-request history and surface team delivery insights"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

/// Classify an error into an exit code.
///
///   0: success
///   1: general/unknown error
///   2: configuration error
///   3: not initialized / unknown repository, team, or insight
///   4: database error
///   5: GitHub API error (auth, rate limit)
///   6: inference / LLM API error
fn classify_exit_code(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}");
    let lower = msg.to_lowercase();

    if lower.contains("not initialized")
        || lower.contains("cannot resolve path")
        || lower.contains("is not tracked")
        || lower.contains("unknown team")
    {
        3 // nothing to act on
    } else if lower.contains("config") {
        2 // config error
    } else if lower.contains("not found:") {
        3 // unknown row
    } else if lower.contains("database") || lower.contains("sqlite") || lower.contains("store error")
    {
        4 // database error
    } else if lower.contains("github api")
        || lower.contains("fetch error")
        || lower.contains("rate limit")
        || lower.contains("api auth")
    {
        5 // remote API error
    } else if lower.contains("llm") || lower.contains("inference") || lower.contains("api_key") {
        6 // inference error
    } else {
        1 // general error
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // One process-wide TLS provider for the GitHub and LLM clients.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: Failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(commands::run(cli.command)) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(classify_exit_code(&e));
        }
    }
}
