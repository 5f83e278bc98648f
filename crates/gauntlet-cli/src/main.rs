use anyhow::Context;
use clap::{Parser, Subcommand};
use gauntlet_core::engine::{ExecutorConfig, RunExecutor, Scheduler, SchedulerConfig};
use gauntlet_core::providers::ProviderRegistry;
use gauntlet_core::storage::Store;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "gauntlet",
    version,
    about = "Run execution engine for model test cases"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the queue and execute pending runs until interrupted
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Path to the SQLite database (created if missing)
    #[arg(long, env = "GAUNTLET_DB", default_value = "gauntlet.db")]
    db: PathBuf,
    /// Poll interval in seconds
    #[arg(long, default_value_t = 5)]
    tick_secs: u64,
    /// Maximum runs executed concurrently by this process
    #[arg(long, default_value_t = 3)]
    max_concurrent: usize,
    /// Per-provider-call timeout in seconds (unbounded when omitted)
    #[arg(long)]
    call_timeout_secs: Option<u64>,
    /// Model used for judge calls
    #[arg(long, env = "GAUNTLET_JUDGE_MODEL", default_value = "gpt-4o")]
    judge_model: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Cli::parse().cmd {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let store = Store::open(&args.db)
        .with_context(|| format!("opening database at {}", args.db.display()))?;
    let registry = Arc::new(ProviderRegistry::with_builtins());
    let executor = Arc::new(RunExecutor::new(
        store.clone(),
        registry,
        ExecutorConfig {
            judge_model: args.judge_model,
            call_timeout: args.call_timeout_secs.map(Duration::from_secs),
        },
    ));
    let scheduler = Scheduler::new(
        store,
        executor,
        SchedulerConfig {
            tick: Duration::from_secs(args.tick_secs.max(1)),
            max_concurrent: args.max_concurrent,
        },
    );

    tracing::info!(db = %args.db.display(), "gauntlet serving");
    tokio::select! {
        () = scheduler.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested, draining in-flight runs");
            scheduler.drain().await;
        }
    }
    Ok(())
}
