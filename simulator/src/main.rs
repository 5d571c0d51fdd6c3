//! Corebank Simulator
//!
//! Drives the ledger engine with named scenarios or a seeded random
//! workload and checks the ledger invariants afterwards.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use corebank_common::{Currency, Money};
use corebank_ledger::postgres::connect_with_retry;
use corebank_ledger::{LedgerConfig, LedgerEngine, LedgerStore, MemoryStore};

mod bank;
mod controller;
mod metrics;
mod scenario;

use bank::SimulatedBank;
use controller::{SimulationController, WorkloadOptions};
use scenario::Scenario;

/// Corebank Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Corebank ledger load and scenario simulator")]
struct Args {
    /// Number of accounts for the random workload
    #[arg(short, long, default_value = "10")]
    accounts: usize,

    /// Opening balance of each account, in USD
    #[arg(long, default_value = "1000.00")]
    initial_balance: String,

    /// Scenario to run instead of the random workload
    #[arg(short, long)]
    scenario: Option<String>,

    /// Concurrent client tasks
    #[arg(short, long, default_value = "8")]
    concurrency: usize,

    /// Transactions to submit
    #[arg(short, long, default_value = "1000")]
    transactions: usize,

    /// Probability of resubmitting a transaction under the same key
    #[arg(long, default_value = "0.1")]
    duplicate_rate: f64,

    /// Probability of reversing an earlier applied transaction
    #[arg(long, default_value = "0.05")]
    reversal_rate: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = LedgerConfig::from_env();
    config.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    if args.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    anyhow::ensure!(
        (0.0..=1.0).contains(&args.duplicate_rate) && (0.0..=1.0).contains(&args.reversal_rate),
        "rates must be between 0 and 1"
    );

    info!("Starting Corebank Simulator");

    let scenario = args.scenario.as_deref().map(Scenario::load).transpose()?;
    let needs_faults = scenario.as_ref().is_some_and(Scenario::needs_fault_hooks);

    let (store, faults): (Arc<dyn LedgerStore>, Option<Arc<MemoryStore>>) =
        match &config.store.database_url {
            Some(_) if !needs_faults => {
                info!("Using PostgreSQL store");
                let store = connect_with_retry(&config.store, 5)
                    .await
                    .context("connecting to the database")?;
                (Arc::new(store), None)
            }
            url => {
                if url.is_some() {
                    warn!("Scenario injects faults; using the in-memory store instead of PostgreSQL");
                }
                let store = Arc::new(MemoryStore::new());
                (store.clone(), Some(store))
            }
        };

    let engine = Arc::new(LedgerEngine::with_config(store, config.engine.clone())?);
    let mut controller = SimulationController::new(SimulatedBank::new(engine.clone(), faults));
    let started = Instant::now();

    let violations = match scenario {
        Some(scenario) => {
            controller.run_scenario(scenario).await?;
            Vec::new()
        }
        None => {
            let initial = Money::parse(&args.initial_balance, Currency::usd())
                .context("parsing --initial-balance")?;
            let options = WorkloadOptions {
                accounts: args.accounts,
                initial_balance: initial.amount.minor(),
                concurrency: args.concurrency,
                transactions: args.transactions,
                duplicate_rate: args.duplicate_rate,
                reversal_rate: args.reversal_rate,
                seed: args.seed.unwrap_or_else(rand::random),
            };
            info!(seed = options.seed, "Workload seed");
            controller.run_random(&options).await?
        }
    };

    let elapsed = started.elapsed().as_secs_f64();
    let metrics = controller.get_metrics().await;
    info!("Simulation complete");
    info!("Total transactions: {}", metrics.total_transactions);
    info!("Applied: {}", metrics.applied);
    info!("Failed: {}", metrics.failed);
    info!("Errors: {}", metrics.errors);
    info!("Duplicates: {}", metrics.duplicates);
    info!("Reversals: {}", metrics.reversals);
    info!(
        "Latency avg/p50/p99: {}/{}/{}us",
        metrics.average_latency_us(),
        metrics.p50_latency_us(),
        metrics.p99_latency_us()
    );
    info!("Throughput: {:.1} tx/s", metrics.throughput(elapsed));
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    print!("{}", engine.metrics().to_prometheus());

    if !violations.is_empty() {
        for violation in &violations {
            warn!("Invariant violated: {}", violation);
        }
        anyhow::bail!("{} invariant violations", violations.len());
    }

    Ok(())
}
