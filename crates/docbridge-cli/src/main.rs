mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::cache::CacheSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "docbridge",
    about = "Bridge documentation work items from the tracker into GitHub issues",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .docbridge/ or .git/)
    #[arg(long, global = true, env = "DOCBRIDGE_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize docbridge in the current project
    Init {
        /// Saved query URL whose results seed each batch
        #[arg(long)]
        query_url: String,
    },

    /// Run the saved query and cache new work items
    Fetch,

    /// Fetch, then drive every cached item through the pipeline
    Process {
        /// Log every decision without creating or mutating anything
        #[arg(long)]
        dry_run: bool,

        /// Put failed items back into the pipeline first
        #[arg(long)]
        retry_failed: bool,

        /// Only process this cached work item (skips the fetch)
        #[arg(long)]
        item: Option<u64>,
    },

    /// Re-drive cached items without fetching (picks up after a crash)
    Resume {
        #[arg(long)]
        dry_run: bool,
    },

    /// Show per-item processing state
    State,

    /// Show the processing log
    Log {
        /// Only the last N lines
        #[arg(long, default_value = "50")]
        tail: usize,
    },

    /// Inspect or clear the local work item cache
    Cache {
        #[command(subcommand)]
        subcommand: CacheSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { query_url } => cmd::init::run(&root, &query_url),
        Commands::Fetch => cmd::fetch::run(&root, cli.json),
        Commands::Process {
            dry_run,
            retry_failed,
            item,
        } => cmd::process::run(&root, dry_run, retry_failed, item.is_none(), item, cli.json),
        Commands::Resume { dry_run } => {
            cmd::process::run(&root, dry_run, false, false, None, cli.json)
        }
        Commands::State => cmd::state::run(&root, cli.json),
        Commands::Log { tail } => cmd::log::run(&root, tail),
        Commands::Cache { subcommand } => cmd::cache::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
