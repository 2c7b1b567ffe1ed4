//! Mailvault - versioned Gmail backup and restore
//!
//! Thin CLI over the vault crate: argument parsing, logging setup and
//! engine wiring. All reconciliation logic lives in the library.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use vault::{
    CachedTokenProvider, CancelToken, FileLinkStore, GmailRemote, MailboxEngine, RestoreFilter,
    SessionPool, StaticTokenProvider, VaultSettings,
};

#[derive(Parser)]
#[command(name = "mailvault")]
#[command(version, about = "Versioned Gmail backup and restore")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Archive root directory (default from settings, else ./backup)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Worker pool width for per-item fan-out
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Log every mutation but perform none of them
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Back up an account into the archive
    Backup {
        /// Account to back up
        #[arg(long)]
        email: Option<String>,

        /// Only enumerate the last N days and skip the deletion step
        #[arg(long)]
        quick_sync_days: Option<u32>,
    },
    /// Upload archived messages back to an account
    Restore {
        /// Account the archive was taken from
        #[arg(long)]
        email: Option<String>,

        /// Destination account (defaults to --email)
        #[arg(long)]
        to_email: Option<String>,

        /// Also restore messages whose archive records are tombstoned
        #[arg(long)]
        restore_deleted: bool,

        /// Restore messages absent from the destination account
        #[arg(long)]
        restore_missing: bool,

        /// Extra label name to attach to every restored message
        #[arg(long = "add-label")]
        add_labels: Vec<String>,

        /// Only records versioned at or after this date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        filter_date_from: Option<String>,

        /// Only records versioned before this date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        filter_date_to: Option<String>,
    },
}

fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date: {value} (expected YYYY-MM-DD or RFC 3339)"))?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .context("Invalid date")?
        .and_utc())
}

fn build_engine(
    email: &str,
    root: PathBuf,
    workers: usize,
    dry_run: bool,
    cancel: &CancelToken,
) -> Result<MailboxEngine> {
    let store = Arc::new(FileLinkStore::new(&root)?);
    info!("Archive root: {}", root.display());

    let token = vault::token_from_env()?;
    let provider = CachedTokenProvider::new(
        store.clone(),
        Arc::new(StaticTokenProvider::new(token)),
    );
    let sessions = SessionPool::new(Arc::new(provider));
    let remote = Arc::new(GmailRemote::new(sessions, cancel.clone()));

    Ok(MailboxEngine::new(email, store, remote)
        .with_workers(workers)
        .with_dry_run(dry_run))
}

fn run(cli: Cli, settings: &VaultSettings, cancel: &CancelToken) -> Result<()> {
    let root = cli.root.unwrap_or_else(|| settings.root_or_default());
    let workers = cli.workers.unwrap_or_else(|| settings.workers_or_default());

    match cli.command {
        Command::Backup {
            email,
            quick_sync_days,
        } => {
            let email = email
                .or_else(|| settings.email.clone())
                .context("No account given; pass --email or set it in settings")?;
            let quick_sync_days = quick_sync_days.or(settings.quick_sync_days);
            let engine = build_engine(&email, root, workers, cli.dry_run, cancel)?;

            let stats = engine.backup(quick_sync_days, cancel)?;
            info!(
                "Backup done: {} remote, {} payloads, {} metadata, {} tombstoned",
                stats.remote_messages,
                stats.payload_writes,
                stats.metadata_writes,
                stats.tombstoned
            );
            Ok(())
        }
        Command::Restore {
            email,
            to_email,
            restore_deleted,
            restore_missing,
            add_labels,
            filter_date_from,
            filter_date_to,
        } => {
            let email = email
                .or_else(|| settings.email.clone())
                .context("No account given; pass --email or set it in settings")?;
            let engine = build_engine(&email, root, workers, cli.dry_run, cancel)?;

            let filter = RestoreFilter::new()
                .with_match_deleted(restore_deleted)
                .with_match_missing(restore_missing)
                .with_date_from(filter_date_from.as_deref().map(parse_date).transpose()?)
                .with_date_to(filter_date_to.as_deref().map(parse_date).transpose()?);

            let stats = engine.restore(&filter, to_email.as_deref(), &add_labels, cancel)?;
            info!(
                "Restore done: {} candidates, {} uploaded, {} chat skipped",
                stats.candidates, stats.uploaded, stats.skipped_chat
            );
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let settings = match VaultSettings::load() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load settings: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let cli = Cli::parse();
    let cancel = CancelToken::new();

    // Ctrl+C / SIGTERM stop the pass between items; the tombstone step
    // never runs after a cancelled pass
    let handler_cancel = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Interrupt received, cancelling...");
        handler_cancel.cancel();
    }) {
        error!("Failed to install interrupt handler: {e}");
    }

    match run(cli, &settings, &cancel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
