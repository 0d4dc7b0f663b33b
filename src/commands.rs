//! Subcommand handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use leaseq_queue::{
    ItemHandler, LeaseQueue, QueueItem, QueueStats, ReportOutcome, RetryPolicy, WorkerPool,
};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tracing::info;

use crate::cli::{Commands, OutputFormat};
use crate::config::AppConfig;
use crate::exec_handler::ExecHandler;

type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Printable view of an item; the payload is shown as text.
#[derive(Serialize)]
struct ItemView<'a> {
    id: i64,
    priority: i32,
    status: &'a str,
    retry_count: u32,
    payload: String,
    created_at: String,
    processed_at: Option<String>,
    last_error: Option<&'a str>,
    locked_by: Option<&'a str>,
    locked_until: Option<String>,
}

impl<'a> From<&'a QueueItem> for ItemView<'a> {
    fn from(item: &'a QueueItem) -> Self {
        Self {
            id: item.id,
            priority: item.priority,
            status: item.status.as_str(),
            retry_count: item.retry_count,
            payload: item.payload_lossy(),
            created_at: item.created_at.to_rfc3339(),
            processed_at: item.processed_at.map(|t| t.to_rfc3339()),
            last_error: item.last_error.as_deref(),
            locked_by: item.locked_by.as_deref(),
            locked_until: item.locked_until.map(|t| t.to_rfc3339()),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> CmdResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_stats_table(stats: &QueueStats) {
    println!("{:<12} {:>10}", "STATUS", "COUNT");
    println!("{:<12} {:>10}", "pending", stats.pending);
    println!("{:<12} {:>10}", "processing", stats.processing);
    println!("{:<12} {:>10}", "completed", stats.completed);
    println!("{:<12} {:>10}", "failed", stats.failed);
    println!("{:<12} {:>10}", "total", stats.total);
}

fn print_outcome(id: i64, outcome: &ReportOutcome) {
    match outcome {
        ReportOutcome::Completed => println!("item {} completed", id),
        ReportOutcome::Requeued { retry_count } => {
            println!("item {} requeued (retry_count={})", id, retry_count)
        }
        ReportOutcome::Failed { retry_count } => {
            println!("item {} failed permanently (retry_count={})", id, retry_count)
        }
        ReportOutcome::Ignored(reason) => println!("item {} unchanged: {}", id, reason),
    }
}

async fn read_payload(payload: Option<String>, file: Option<PathBuf>) -> std::io::Result<Vec<u8>> {
    if let Some(text) = payload {
        return Ok(text.into_bytes());
    }
    if let Some(path) = file {
        return tokio::fs::read(path).await;
    }
    let mut buf = Vec::new();
    tokio::io::stdin().read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Execute one subcommand against the configured queue.
pub(crate) async fn run(command: Commands, config: AppConfig) -> CmdResult {
    let queue = LeaseQueue::open(config.queue.clone()).await?;

    match command {
        Commands::Enqueue {
            priority,
            file,
            payload,
        } => {
            let payload = read_payload(payload, file).await?;
            let id = queue.enqueue(priority, payload).await?;
            println!("{}", id);
        }
        Commands::Claim { worker, lease_secs } => {
            let worker = worker.unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4()));
            let lease = lease_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| queue.config().lease());
            match queue.claim_with_lease(&worker, lease).await? {
                Some(item) => print_json(&ItemView::from(&item))?,
                None => println!("empty"),
            }
        }
        Commands::Complete { id, worker } => {
            let outcome = queue.complete(id, &worker).await?;
            print_outcome(id, &outcome);
        }
        Commands::Fail {
            id,
            worker,
            error,
            max_retries,
        } => {
            let policy = max_retries
                .map(RetryPolicy::new)
                .unwrap_or_else(|| queue.config().retry_policy());
            let outcome = queue.fail_with_policy(id, &worker, &error, policy).await?;
            print_outcome(id, &outcome);
        }
        Commands::Stats { format } => {
            let stats = queue.stats().await?;
            match format {
                OutputFormat::Table => print_stats_table(&stats),
                OutputFormat::Json => print_json(&stats)?,
            }
        }
        Commands::Cleanup { retention_days } => {
            let days = retention_days.unwrap_or(queue.config().retention_days);
            let deleted = queue.cleanup(days).await?;
            println!("{}", deleted);
        }
        Commands::Inspect { id } => {
            let item = queue.get(id).await?;
            print_json(&ItemView::from(&item))?;
        }
        Commands::Failed { limit } => {
            let items = queue.failed_items(limit).await?;
            let views: Vec<ItemView<'_>> = items.iter().map(ItemView::from).collect();
            print_json(&views)?;
        }
        Commands::Work { exec, workers } => {
            let mut pool_config = config.queue.clone();
            if let Some(workers) = workers {
                pool_config.workers = workers;
            }
            pool_config.validate()?;
            run_pool(Arc::new(queue), pool_config, Arc::new(ExecHandler::new(exec))).await?;
        }
    }

    Ok(())
}

async fn run_pool(
    queue: Arc<LeaseQueue>,
    config: leaseq_queue::QueueConfig,
    handler: Arc<dyn ItemHandler>,
) -> CmdResult {
    let pool = WorkerPool::new(config);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping workers");
            let _ = shutdown_tx.send(());
        }
    });

    pool.run(queue, handler, shutdown_rx).await;
    Ok(())
}
