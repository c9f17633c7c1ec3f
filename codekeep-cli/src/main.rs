/*!
Codekeep CLI - command-line host for the Codekeep backup and retention jobs.

Runs snapshots and prunes on demand, delivers schedule ticks to the backup
dispatcher (for use from cron or a container scheduler), lists archive
objects, and manages the code entries held in the key-value store.
*/

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use codekeep_core::{
    add_code, backup_dispatcher, create_archive_store, create_kv_store, list_all_objects,
    list_codes, observability, parse_archive_name, remove_code, BackupConfig, BackupEnv,
    CodeEntry, ExecutionContext, KvConfig, ScheduledEvent, StorageConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{Table, Tabled};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "codekeep")]
#[command(about = "Scheduled backups and retention for Codekeep code storage")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "CODEKEEP_JSON_LOGS")]
    json_logs: bool,

    /// Print Prometheus metrics after the command completes
    #[cfg(feature = "metrics")]
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(flatten)]
    stores: StoreArgs,

    #[command(flatten)]
    backup: BackupArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StoreArgs {
    /// Archive location: a directory, `s3://bucket/prefix`, or `memory://`
    #[arg(long, global = true, env = "CODEKEEP_ARCHIVE", default_value = "./codekeep-data/archives")]
    archive: String,

    /// Directory holding the key-value store
    #[arg(long, global = true, env = "CODEKEEP_KV_DIR", default_value = "./codekeep-data/kv")]
    kv_dir: PathBuf,
}

#[derive(Args)]
struct BackupArgs {
    /// Only keys under this prefix are archived
    #[arg(long, global = true, env = "CODEKEEP_KEY_PREFIX", default_value = codekeep_core::config::DEFAULT_KEY_PREFIX)]
    key_prefix: String,

    /// Retention window applied when a prune names none
    #[arg(long, global = true, env = "CODEKEEP_RETENTION_DAYS", default_value_t = codekeep_core::config::DEFAULT_RETENTION_DAYS)]
    default_retention_days: u32,

    /// Schedule string the snapshot job listens on
    #[arg(long, global = true, env = "CODEKEEP_BACKUP_SCHEDULE", default_value = codekeep_core::config::DEFAULT_BACKUP_SCHEDULE)]
    backup_schedule: String,

    /// Schedule string the prune job listens on (defaults to the backup schedule)
    #[arg(long, global = true, env = "CODEKEEP_PRUNE_SCHEDULE")]
    prune_schedule: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write one archive of every key under the prefix
    Snapshot,
    /// Delete archives older than the retention window
    Prune {
        /// Override the default retention window for this run
        #[arg(long)]
        retention_days: Option<u32>,
    },
    /// Deliver a schedule tick to the registered jobs
    Dispatch {
        /// Schedule string exactly as configured on the trigger
        schedule: String,
    },
    /// List archive objects
    Archives,
    /// Save a named code for a user, replacing one with the same name
    AddCode {
        #[arg(long)]
        guild: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        code: String,
    },
    /// Remove a named code from a user
    RemoveCode {
        #[arg(long)]
        guild: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
    },
    /// Show the codes saved by a user
    Codes {
        #[arg(long)]
        guild: String,
        #[arg(long)]
        user: String,
    },
}

#[derive(Tabled)]
struct ArchiveRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Taken")]
    taken: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[derive(Tabled)]
struct CodeRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Code")]
    code: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    observability::init_logging(cli.verbose, cli.json_logs)?;

    let config = backup_config(&cli.backup)?;
    let env = build_env(&cli.stores, config).await?;

    match cli.command {
        Commands::Snapshot => run_snapshot(&env).await?,
        Commands::Prune { retention_days } => run_prune(&env, retention_days).await?,
        Commands::Dispatch { schedule } => run_dispatch(env, &schedule).await?,
        Commands::Archives => list_archives(&env).await?,
        Commands::AddCode {
            guild,
            user,
            name,
            code,
        } => {
            let replaced = add_code(env.kv.as_ref(), &guild, &user, CodeEntry::new(name, code)).await?;
            println!("✓ Code {}", if replaced { "updated" } else { "saved" });
        }
        Commands::RemoveCode { guild, user, name } => {
            if remove_code(env.kv.as_ref(), &guild, &user, &name).await? {
                println!("✓ Code '{name}' removed");
            } else {
                println!("No code named '{name}'");
            }
        }
        Commands::Codes { guild, user } => show_codes(&env, &guild, &user).await?,
    }

    #[cfg(feature = "metrics")]
    {
        if cli.print_metrics {
            print!("{}", observability::BackupMetrics::global().gather_metrics()?);
        }
    }

    Ok(())
}

fn backup_config(args: &BackupArgs) -> Result<BackupConfig, anyhow::Error> {
    let config = BackupConfig {
        key_prefix: args.key_prefix.clone(),
        retention_days: args.default_retention_days,
        backup_schedule: args.backup_schedule.clone(),
        prune_schedule: args.prune_schedule.clone(),
    };
    config.validate()?;
    Ok(config)
}

async fn build_env(stores: &StoreArgs, config: BackupConfig) -> Result<BackupEnv, anyhow::Error> {
    let storage_config = StorageConfig::from_uri(&stores.archive)
        .with_context(|| format!("Invalid archive location '{}'", stores.archive))?;
    debug!(?storage_config, kv_dir = %stores.kv_dir.display(), "Opening stores");

    let archive = create_archive_store(&storage_config).await?;
    let kv = create_kv_store(&KvConfig::local(stores.kv_dir.clone()))?;
    Ok(BackupEnv::new(kv, archive, config))
}

async fn run_snapshot(env: &BackupEnv) -> Result<(), anyhow::Error> {
    let report = env.snapshot_producer().try_snapshot().await?;

    println!("✓ Wrote {}", report.name);
    println!("  Keys: {}", report.key_count);
    if report.skipped > 0 {
        println!("  Skipped (deleted during backup): {}", report.skipped);
    }
    println!("  Size: {}", format_size(report.size_bytes as u64));
    println!("  Timestamp: {}", report.timestamp);
    Ok(())
}

async fn run_prune(env: &BackupEnv, retention_days: Option<u32>) -> Result<(), anyhow::Error> {
    let report = env.retention_pruner().try_prune(retention_days).await?;

    if report.deleted.is_empty() {
        println!(
            "No archives older than {} days ({} scanned)",
            report.retention_days, report.scanned
        );
    } else {
        println!(
            "✓ Deleted {} archive(s) older than {} days",
            report.deleted.len(),
            report.retention_days
        );
        for name in &report.deleted {
            println!("  {name}");
        }
    }
    Ok(())
}

async fn run_dispatch(env: BackupEnv, schedule: &str) -> Result<(), anyhow::Error> {
    let dispatcher = backup_dispatcher(&env.config);
    let ctx = ExecutionContext::new();

    info!(schedule = %schedule, "Delivering schedule tick");
    let ran = dispatcher
        .dispatch(&ScheduledEvent::now(schedule), Arc::new(env), &ctx)
        .await?;

    if ran == 0 {
        println!("No jobs registered for '{schedule}'");
        println!("Registered schedules:");
        for registered in dispatcher.schedules() {
            println!(
                "  '{registered}' ({} job(s))",
                dispatcher.handler_count(registered)
            );
        }
    } else {
        println!("✓ Ran {ran} job(s) for '{schedule}'");
    }
    Ok(())
}

async fn list_archives(env: &BackupEnv) -> Result<(), anyhow::Error> {
    let objects = list_all_objects(env.archive.as_ref()).await?;

    let rows: Vec<ArchiveRow> = objects
        .into_iter()
        .map(|object| ArchiveRow {
            taken: parse_archive_name(&object.name)
                .map(format_millis)
                .unwrap_or_else(|| "-".to_string()),
            size: object
                .size
                .map(format_size)
                .unwrap_or_else(|| "Unknown".to_string()),
            name: object.name,
        })
        .collect();

    if rows.is_empty() {
        println!("No archives found");
    } else {
        println!("{}", Table::new(rows));
    }
    Ok(())
}

async fn show_codes(env: &BackupEnv, guild: &str, user: &str) -> Result<(), anyhow::Error> {
    let codes = list_codes(env.kv.as_ref(), guild, user).await?;
    if codes.is_empty() {
        println!("No codes saved");
        return Ok(());
    }

    let rows: Vec<CodeRow> = codes
        .into_iter()
        .map(|entry| CodeRow {
            name: entry.name,
            code: entry.code,
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_millis(millis: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(millis) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => millis.to_string(),
    }
}
