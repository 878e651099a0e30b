//! Stagehand CLI - Main entry point

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stagehand_common::logging::{init_logging, LogConfig, LogLevel};
use stagehand_engine::{
    EngineConfig, ErrorKind, LogQuery, MigrationEngine, Record, Table, TableOutcome,
};
use stagehand_engine::schema::MAX_BATCH_SIZE;

#[derive(Parser)]
#[command(name = "stagehand", version, about = "Bulk migration and backup/restore for PostgreSQL and S3")]
struct Cli {
    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging on the console
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load historical CSV files, replacing table contents
    Migrate {
        /// Only this table; all tables in dependency order otherwise
        #[arg(long)]
        table: Option<Table>,

        /// Directory holding `{table}.csv` files
        #[arg(long, env = "STAGEHAND_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },

    /// Export a table to chunked Parquet files
    Backup {
        table: Table,

        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Replace a table with the contents of a backup
    Restore {
        table: Table,

        /// Backup directory or manifest; the latest backup when omitted
        path: Option<String>,

        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Submit a JSON array of records through the online path
    Ingest { table: Table, file: PathBuf },

    /// List published backups of a table, oldest first
    Backups { table: Table },

    /// Query the migration log
    Logs {
        #[arg(long)]
        table: Option<Table>,

        #[arg(long)]
        error_kind: Option<ErrorKind>,

        /// Only entries from the last N hours
        #[arg(long)]
        last_hours: Option<i64>,

        #[arg(long, default_value_t = 100)]
        limit: i64,

        /// Counts per table and kind instead of entries
        #[arg(long)]
        summary: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // `.env` feeds both the logging and the engine configuration
    dotenvy::dotenv().ok();

    let _guard = match logging_config(cli.verbose).and_then(|config| Ok(init_logging(&config)?)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {:#}", e);
            process::exit(1);
        },
    };

    if let Err(e) = run(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

/// Console and file logging; `LOG_*` environment variables take precedence
fn logging_config(verbose: bool) -> Result<LogConfig> {
    LogConfig::builder()
        .level(if verbose { LogLevel::Debug } else { LogLevel::Info })
        .log_file_prefix("stagehand")
        .filter_directives("stagehand_engine=debug,sqlx=warn,aws_config=warn,aws_smithy_runtime=warn")
        .build()
        .merge_env()
        .context("reading LOG_* settings")
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = EngineConfig::from_env().context("loading configuration")?;
    match &cli.command {
        Command::Backup {
            chunk_size: Some(n),
            ..
        } => config.migration.chunk_size = *n,
        Command::Migrate {
            data_dir: Some(dir),
            ..
        } => config.migration.data_dir = dir.clone(),
        _ => {},
    }

    let engine = MigrationEngine::connect(config)
        .await
        .context("connecting to database and staging store")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next chunk boundary");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::Migrate { table, .. } => {
            let data_dir = engine.config().migration.data_dir.clone();
            match table {
                Some(table) => {
                    let report = engine
                        .migrate_table(table, data_dir.join(format!("{}.csv", table)))
                        .await?;
                    print_report(cli.json, &report, || {
                        format!(
                            "{}: {} read, {} rejected, {} loaded ({})",
                            report.table,
                            report.records_read,
                            report.records_rejected + report.load.rows_rejected,
                            report.load.rows_loaded,
                            report.log_reference
                        )
                    })?;
                },
                None => {
                    let outcomes = engine.migrate_all(Some(&data_dir)).await?;
                    print_report(cli.json, &outcomes, || {
                        outcomes
                            .iter()
                            .map(|outcome| match outcome {
                                TableOutcome::Migrated(r) => format!(
                                    "{}: {} read, {} rejected, {} loaded",
                                    r.table,
                                    r.records_read,
                                    r.records_rejected + r.load.rows_rejected,
                                    r.load.rows_loaded
                                ),
                                TableOutcome::Skipped { table, path } => {
                                    format!("{}: skipped, {} not found", table, path.display())
                                },
                            })
                            .collect::<Vec<_>>()
                            .join("\n")
                    })?;
                },
            }
        },

        Command::Backup { table, .. } => {
            let report = engine.backup_with_cancel(table, &cancel).await?;
            let manifest = &report.manifest;
            print_report(cli.json, &report, || {
                format!(
                    "{}: {} rows in {} chunks at {}",
                    manifest.table, manifest.row_count, manifest.chunk_count, manifest.backup_path
                )
            })?;
        },

        Command::Restore {
            table,
            path,
            chunk_size,
        } => {
            let report = engine
                .restore_with_cancel(table, path.as_deref(), chunk_size, &cancel)
                .await?;
            print_report(cli.json, &report, || {
                format!(
                    "{}: {} rows restored from {}, {} rows failed; {} of {} chunks partial, {} failed ({})",
                    report.table,
                    report.rows_restored,
                    report.backup_path,
                    report.rows_failed,
                    report.chunks_partial,
                    report.chunks_total,
                    report.chunks_failed,
                    report.log_reference
                )
            })?;
            if report.cancelled {
                bail!(
                    "restore of {} was cancelled; the table holds only {} rows of the backup",
                    table,
                    report.rows_restored
                );
            }
        },

        Command::Ingest { table, file } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let records: Vec<Record> =
                serde_json::from_slice(&data).context("expected a JSON array of objects")?;
            info!(%table, records = records.len(), "Submitting records");

            let mut reports = Vec::new();
            for batch in records.chunks(MAX_BATCH_SIZE) {
                reports.push(engine.submit_batch(table, batch.to_vec()).await?);
            }
            print_report(cli.json, &reports, || {
                let accepted: u64 = reports.iter().map(|r| r.success_count).sum();
                let rejected: u64 = reports.iter().map(|r| r.error_count).sum();
                let mut lines = vec![format!("{}: {} accepted, {} rejected", table, accepted, rejected)];
                for (batch, report) in reports.iter().enumerate() {
                    for e in &report.errors {
                        lines.push(format!(
                            "  record {}: {} {}",
                            batch * MAX_BATCH_SIZE + e.index,
                            e.kind,
                            e.message
                        ));
                    }
                }
                lines.join("\n")
            })?;
        },

        Command::Backups { table } => {
            let manifests = engine.list_backups(table).await?;
            print_report(cli.json, &manifests, || {
                if manifests.is_empty() {
                    return format!("no backups of {}", table);
                }
                manifests
                    .iter()
                    .map(|m| {
                        format!(
                            "{}  {} rows  {} chunks  {}",
                            m.created_at.to_rfc3339(),
                            m.row_count,
                            m.chunk_count,
                            m.backup_path
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        },

        Command::Logs {
            table,
            error_kind,
            last_hours,
            limit,
            summary,
        } => {
            let since = last_hours.map(|h| Utc::now() - chrono::Duration::hours(h));
            if summary {
                let rows = engine.log().summary(since).await?;
                print_report(cli.json, &rows, || {
                    rows.iter()
                        .map(|r| format!("{:<16} {:<24} {}", r.table.as_str(), r.kind.as_str(), r.count))
                        .collect::<Vec<_>>()
                        .join("\n")
                })?;
            } else {
                let query = LogQuery {
                    table,
                    kind: error_kind,
                    since,
                    limit,
                };
                let entries = engine.log().query(&query).await?;
                print_report(cli.json, &entries, || {
                    entries
                        .iter()
                        .map(|e| {
                            format!(
                                "{} {} {} {}{}",
                                e.timestamp.to_rfc3339(),
                                e.table,
                                e.kind,
                                e.record_id.map(|id| format!("[{}] ", id)).unwrap_or_default(),
                                e.message
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })?;
            }
        },
    }

    Ok(())
}

fn print_report<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}
