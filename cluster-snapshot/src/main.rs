//! cluster-snapshot - Main entry point
//!
//! Back up, restore, list and delete Kubernetes cluster snapshots.

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use cluster_snapshot::daemon::ShutdownCoordinator;
use cluster_snapshot::model::progress::{format_bytes, format_duration_ms};
use cluster_snapshot::model::snapshot::sort_snapshots;
use cluster_snapshot::{
    config::Config, utils, BackupOptions, KindRegistry, KubeHttpApi, ProgressState, RestoreOptions,
    Selection, SnapshotStore, Snapshotter, SortKey,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Directory holding snapshots (overrides config)
    #[arg(long, value_name = "DIR", global = true)]
    base_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture cluster resources into a new snapshot
    Backup(BackupArgs),
    /// Replay a snapshot into the cluster
    Restore(RestoreArgs),
    /// List available snapshots
    List(ListArgs),
    /// Delete a snapshot
    Delete(DeleteArgs),
}

#[derive(ClapArgs, Debug)]
struct SelectionArgs {
    /// Namespaces to include (`cluster` for cluster-scoped resources)
    #[arg(short, long = "namespace", value_delimiter = ',')]
    namespaces: Vec<String>,

    /// Namespaces to exclude
    #[arg(long = "exclude-namespace", value_delimiter = ',')]
    exclude_namespaces: Vec<String>,

    /// Resource kinds to include, singular or plural
    #[arg(short, long = "kind", value_delimiter = ',')]
    kinds: Vec<String>,

    /// Resource kinds to exclude
    #[arg(long = "exclude-kind", value_delimiter = ',')]
    exclude_kinds: Vec<String>,
}

impl SelectionArgs {
    fn to_selection(&self) -> Selection {
        Selection::new()
            .include_namespaces(self.namespaces.iter().cloned())
            .exclude_namespaces(self.exclude_namespaces.iter().cloned())
            .include_kinds(self.kinds.iter().cloned())
            .exclude_kinds(self.exclude_kinds.iter().cloned())
    }
}

#[derive(ClapArgs, Debug)]
struct BackupArgs {
    /// Snapshot name (default: backup-YYYY-MM-DD-HH-MM-SS)
    #[arg(long)]
    name: Option<String>,

    #[command(flatten)]
    selection: SelectionArgs,

    /// Keep the snapshot as a plain directory
    #[arg(long)]
    no_compress: bool,

    /// Maximum concurrent collection tasks (overrides config)
    #[arg(long)]
    max_concurrent: Option<usize>,
}

#[derive(ClapArgs, Debug)]
struct RestoreArgs {
    /// Snapshot path or name (default: most recent)
    #[arg(short, long)]
    backup: Option<String>,

    #[command(flatten)]
    selection: SelectionArgs,

    /// Validate without changing the cluster
    #[arg(long)]
    dry_run: bool,

    /// Pause after each applied resource
    #[arg(long)]
    wait: bool,

    /// Wait timeout in seconds (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Replace resources that already exist
    #[arg(long)]
    overwrite: bool,
}

#[derive(ClapArgs, Debug)]
struct ListArgs {
    /// Sort by timestamp, name, size or resources
    #[arg(long, default_value = "timestamp")]
    sort_by: SortKey,

    /// Show namespaces, kinds and location
    #[arg(long)]
    detail: bool,
}

#[derive(ClapArgs, Debug)]
struct DeleteArgs {
    /// Snapshot path or name
    backup: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => Config::default(),
    }
    .with_env_overrides();
    if let Some(base_dir) = &args.base_dir {
        config.storage.base_dir = base_dir.clone();
    }

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    utils::logger::init(&log_level, args.verbose)?;

    tracing::debug!("cluster-snapshot v{}", env!("CARGO_PKG_VERSION"));

    let store = SnapshotStore::new(&config.storage.base_dir);

    match args.command {
        Command::Backup(backup) => run_backup(&config, store, backup).await,
        Command::Restore(restore) => run_restore(&config, store, restore).await,
        Command::List(list) => run_list(&store, list).await,
        Command::Delete(delete) => {
            let path = store.locate(&delete.backup)?;
            store.delete(&path).await?;
            println!("Deleted {}", path.display());
            Ok(())
        }
    }
}

fn connect(config: &Config, store: SnapshotStore) -> Result<Snapshotter> {
    let api = KubeHttpApi::from_config(&config.api).context("cannot reach the cluster")?;
    Ok(Snapshotter::new(
        Arc::new(api),
        Arc::new(KindRegistry::builtin()),
        store,
    ))
}

/// Start listening for SIGINT/SIGTERM.
fn shutdown_coordinator() -> Arc<ShutdownCoordinator> {
    let coordinator = Arc::new(ShutdownCoordinator::new());
    coordinator.listen();
    coordinator
}

fn log_progress(progress: &ProgressState) {
    tracing::info!("[{:>5.1}%] {}", progress.percent(), progress.current_message);
}

async fn run_backup(config: &Config, store: SnapshotStore, args: BackupArgs) -> Result<()> {
    let engine = connect(config, store)?;

    let name = args
        .name
        .unwrap_or_else(|| chrono::Local::now().format("backup-%Y-%m-%d-%H-%M-%S").to_string());

    // Configured exclusions yield to namespaces named on the command line.
    let default_excludes = config
        .backup
        .exclude_namespaces
        .iter()
        .filter(|ns| !args.selection.namespaces.contains(ns))
        .cloned();

    let mut options = BackupOptions::new(name);
    options.selection = args.selection.to_selection().exclude_namespaces(default_excludes);
    options.compress = config.backup.compress && !args.no_compress;
    options.max_concurrent_partitions = args
        .max_concurrent
        .unwrap_or(config.backup.max_concurrent_partitions);

    let shutdown = shutdown_coordinator();
    let token = shutdown.token();

    let mut warnings = 0;
    let metadata = engine
        .create_backup(&options, &token, |progress| {
            warnings = progress.warnings.len();
            log_progress(progress);
        })
        .await?;

    println!("Backup completed: {}", metadata.name);
    println!("  Resources:  {}", metadata.total_resources);
    println!("  Namespaces: {}", metadata.namespaces.len());
    println!("  Size:       {}", format_bytes(metadata.size_bytes));
    println!("  Location:   {}", metadata.path.display());
    if warnings > 0 {
        println!("  Warnings:   {} (see log)", warnings);
    }
    Ok(())
}

async fn run_restore(config: &Config, store: SnapshotStore, args: RestoreArgs) -> Result<()> {
    let input = match &args.backup {
        Some(backup) => Some(store.locate(backup)?),
        None => None,
    };
    let engine = connect(config, store)?;

    let options = RestoreOptions {
        input,
        selection: args.selection.to_selection(),
        dry_run: args.dry_run,
        wait: args.wait,
        timeout: Duration::from_secs(args.timeout.unwrap_or(config.restore.timeout_secs)),
        wait_ceiling: Duration::from_secs(config.restore.wait_ceiling_secs),
        overwrite_existing: args.overwrite,
    };

    let shutdown = shutdown_coordinator();
    let token = shutdown.token();

    let result = engine
        .restore_backup(&options, &token, log_progress)
        .await?;

    let heading = if result.cancelled {
        "Restore cancelled"
    } else if result.dry_run {
        "Dry run completed"
    } else {
        "Restore completed"
    };
    println!("{} from {}", heading, result.source.display());
    println!("  Processed:  {}", result.processed);
    println!("  Created:    {}", result.created);
    println!("  Updated:    {}", result.updated);
    println!("  Skipped:    {}", result.skipped);
    println!("  Namespaces: {}", result.namespaces.join(", "));
    println!("  Kinds:      {}", result.kinds.join(", "));
    println!("  Duration:   {}", format_duration_ms(result.duration.as_millis()));

    if !result.errors.is_empty() {
        println!("  Errors:     {}", result.errors.len());
        for err in &result.errors {
            println!("    - {}", err);
        }
        anyhow::bail!("{} resources failed to restore", result.errors.len());
    }
    if result.cancelled {
        anyhow::bail!("restore cancelled, partial result above");
    }
    Ok(())
}

async fn run_list(store: &SnapshotStore, args: ListArgs) -> Result<()> {
    let mut snapshots = store.list().await?;
    sort_snapshots(&mut snapshots, args.sort_by);

    if snapshots.is_empty() {
        println!("No snapshots in {}", store.base_dir().display());
        return Ok(());
    }

    println!(
        "{:<32} {:<20} {:>9} {:>12} {:>10}",
        "NAME", "TIMESTAMP", "RESOURCES", "SIZE", "COMPRESSED"
    );
    for snapshot in &snapshots {
        println!(
            "{:<32} {:<20} {:>9} {:>12} {:>10}",
            snapshot.name,
            snapshot.timestamp.format("%Y-%m-%d %H:%M:%S"),
            snapshot.total_resources,
            format_bytes(snapshot.size_bytes),
            if snapshot.compressed { "yes" } else { "no" }
        );
        if args.detail {
            println!("    Path:       {}", snapshot.path.display());
            println!("    Format:     {}", snapshot.format_version);
            println!("    Source:     {}", snapshot.source_system_version);
            println!("    Namespaces: {}", snapshot.namespaces.join(", "));
            println!("    Kinds:      {}", snapshot.kinds.join(", "));
        }
    }
    Ok(())
}
