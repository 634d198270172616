use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use fieldsync::clock::SystemClock;
use fieldsync::net::ReqwestTransport;
use fieldsync::sync::QueuedOperation;
use fieldsync::{Config, Provider};

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Inspect and drive the offline cache and sync queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror the log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connection, sync and cache state
  Status,
  /// Replay queued operations now
  Sync,
  /// List pending operations
  Queue,
  /// List operations that failed permanently
  Failed,
  /// Put a failed operation back in the queue
  RetryFailed { id: String },
  /// Remove expired cache entries
  Cleanup,
  /// Clear cached records (every domain partition when STORE is omitted)
  ClearCache { store: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let db_path = config.storage.resolved_path()?;
  let _guard = init_logging(&db_path, args.verbose)?;

  let transport = ReqwestTransport::new(config.server.base_url.as_deref())?;
  let provider = Provider::start(config, Arc::new(transport), Arc::new(SystemClock)).await?;

  let result = run(&provider, args.command).await;
  provider.shutdown();
  result
}

async fn run(provider: &Provider, command: Command) -> Result<()> {
  match command {
    Command::Status => {
      let state = provider.snapshot();
      let stats = provider.cache().stats();
      println!("connection:  {:?}", state.connection_quality);
      if let Some(latency) = provider.monitor().last_latency() {
        println!("latency:     {}ms", latency.as_millis());
      }
      match state.last_online_at {
        Some(at) => println!("last online: {}", at.to_rfc3339()),
        None => println!("last online: never"),
      }
      println!("mode:        {:?}", provider.mode());
      println!("sync:        {:?}", state.sync_status);
      println!("pending:     {}", state.pending_operations_count);
      println!("failed:      {}", provider.engine().failed_operations()?.len());
      println!("cache hits:  {} / misses: {}", stats.hits, stats.misses);
    }
    Command::Sync => {
      let report = provider
        .force_sync()
        .await
        .map_err(|e| eyre!("sync did not run: {}", e))?;
      println!(
        "processed {} (succeeded {}, rescheduled {}, dropped {}), {} waiting on backoff{}",
        report.processed,
        report.succeeded,
        report.rescheduled,
        report.dropped,
        report.skipped,
        if report.aborted { ", stopped early" } else { "" }
      );
    }
    Command::Queue => print_operations(&provider.engine().pending_operations()?),
    Command::Failed => print_operations(&provider.engine().failed_operations()?),
    Command::RetryFailed { id } => {
      if !provider.engine().retry_failed(&id)? {
        return Err(eyre!("no failed operation with id {}", id));
      }
      println!("requeued {}", id);
    }
    Command::Cleanup => {
      let removed = provider.cache().cleanup()?;
      println!("removed {} expired entries", removed);
    }
    Command::ClearCache { store } => {
      provider.clear_cache(store.as_deref())?;
      match store {
        Some(store) => println!("cleared {}", store),
        None => println!("cleared all cached records"),
      }
    }
  }
  Ok(())
}

fn print_operations(ops: &[QueuedOperation]) {
  if ops.is_empty() {
    println!("none");
    return;
  }
  for op in ops {
    println!(
      "{}  {:<11} {:<6} {:<8} {}  attempts {}/{}  next {}{}",
      op.id,
      format!("{:?}", op.op_type),
      op.method.as_str(),
      format!("{:?}", op.priority),
      op.endpoint,
      op.attempts,
      op.max_attempts,
      op.scheduled_at.format("%Y-%m-%d %H:%M:%S"),
      op.error
        .as_deref()
        .map(|e| format!("  ({})", e))
        .unwrap_or_default()
    );
  }
}

/// Log to a daily file next to the database, and to stderr when verbose.
fn init_logging(db_path: &Path, verbose: bool) -> Result<WorkerGuard> {
  let log_dir = db_path
    .parent()
    .map(|dir| dir.join("logs"))
    .ok_or_else(|| eyre!("cannot derive a log directory from {}", db_path.display()))?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "fieldsync.log"));
  let filter =
    EnvFilter::try_from_env("FIELDSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr)))
    .init();

  Ok(guard)
}
