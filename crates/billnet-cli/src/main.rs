//! Command-line interface for the billnet command dispatch node.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use billnet_commands::{
    CommandApi, CommandLedger, CommandMonitor, CommandProducer, CommandRequest,
    DeviceActionExecutor, ExecutorConfig, InMemoryDirectory, Inventory, MemoryLedger,
    MonitorConfig, RedbLedger, SharedLedger, SimulatedController,
};
use billnet_core::broker::{InMemoryBroker, MessageBroker};
use billnet_core::config::{DispatchConfig, env_vars};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Consumer group the CLI uses to print notifications.
const PRINTER_GROUP: &str = "cli-printer";

/// Billnet - remote command dispatch for ISP network devices.
#[derive(Parser, Debug)]
#[command(name = "billnet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run an in-process node reading command requests as JSON lines on stdin.
    Run {
        /// JSON file with devices and accounts.
        #[arg(long)]
        inventory: PathBuf,
        /// Ledger file; pending commands are recovered from it on start.
        #[arg(long)]
        ledger: Option<PathBuf>,
    },
    /// Print recent terminal outcomes from a ledger.
    History {
        /// Ledger file.
        #[arg(long)]
        ledger: PathBuf,
        /// Maximum outcomes to print.
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Print pending commands left in a ledger.
    Pending {
        /// Ledger file.
        #[arg(long)]
        ledger: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Run { inventory, ledger } => run_node(&inventory, ledger.as_deref()).await,
        Command::History { ledger, limit } => print_history(&ledger, limit),
        Command::Pending { ledger } => print_pending(&ledger),
    }
}

/// Logs go to stderr; stdout carries JSON lines only.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "billnet={level},billnet_core={level},billnet_commands={level}"
        ))
        .add_directive(tracing::Level::WARN.into())
    });

    if env_vars::log_json() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::error!(error = %e, "Output could not be encoded"),
    }
}

fn open_ledger(path: Option<&Path>) -> Result<SharedLedger> {
    Ok(match path {
        Some(path) => Arc::new(
            RedbLedger::open(path)
                .with_context(|| format!("Failed to open ledger {}", path.display()))?,
        ),
        None => Arc::new(MemoryLedger::default()),
    })
}

async fn run_node(inventory_path: &Path, ledger_path: Option<&Path>) -> Result<()> {
    let config = DispatchConfig::from_env();

    let raw = std::fs::read_to_string(inventory_path)
        .with_context(|| format!("Failed to read inventory {}", inventory_path.display()))?;
    let inventory: Inventory = serde_json::from_str(&raw).context("Invalid inventory")?;
    let directory = Arc::new(InMemoryDirectory::from_inventory(inventory));
    tracing::info!(devices = directory.device_count(), "Inventory loaded");

    let ledger = open_ledger(ledger_path)?;
    let broker = Arc::new(InMemoryBroker::new());
    let notifications = broker
        .subscribe(&config.topics.notifications, PRINTER_GROUP)
        .await?;

    let producer = CommandProducer::with_topic(broker.clone(), config.topics.commands.clone());
    let monitor = Arc::new(CommandMonitor::new(
        broker.clone(),
        producer.clone(),
        ledger,
        MonitorConfig::from_dispatch(&config),
    ));
    let executor = DeviceActionExecutor::new(
        broker.clone(),
        directory,
        Arc::new(SimulatedController),
        ExecutorConfig::from_dispatch(&config),
    );

    executor.start().await?;
    monitor.start().await?;
    let api = CommandApi::new(producer, monitor.clone());

    let printed = Arc::new(AtomicU64::new(0));
    let printer = {
        let printed = printed.clone();
        tokio::spawn(async move {
            while let Some(envelope) = notifications.recv().await {
                println!("{}", envelope.payload);
                printed.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: CommandRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                print_json(&serde_json::json!({ "error": format!("Invalid request: {}", e) }));
                continue;
            }
        };

        match api.submit(request).await {
            Ok(response) => print_json(&response),
            Err(e) => print_json(&serde_json::json!({ "error": e.to_string() })),
        }
    }

    // Drain: every outcome produced so far must be printed
    loop {
        let stats = api.stats().await;
        if stats.pending == 0 && printed.load(Ordering::SeqCst) >= stats.terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    executor.stop().await;
    monitor.stop().await;
    broker.close();
    printer.await.ok();

    let stats = api.stats().await;
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        timed_out = stats.timed_out,
        retried = stats.retried,
        "Node stopped"
    );
    Ok(())
}

fn print_history(path: &Path, limit: usize) -> Result<()> {
    let ledger = RedbLedger::open(path)
        .with_context(|| format!("Failed to open ledger {}", path.display()))?;
    for outcome in ledger.recent_outcomes(limit)? {
        print_json(&outcome);
    }
    Ok(())
}

fn print_pending(path: &Path) -> Result<()> {
    let ledger = RedbLedger::open(path)
        .with_context(|| format!("Failed to open ledger {}", path.display()))?;
    let mut pending = ledger.load_pending()?;
    pending.sort_by_key(|status| status.created_at);
    for status in pending {
        print_json(&status);
    }
    Ok(())
}
