//! qcode-sync command line
//!
//! Checks, plans and migrates the stores named in a `qcode-sync.toml`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use qcode_sync::{AssignMode, FillOutcome, QcodeSync, SchemeVersion};
use serde::Serialize;
use serde_json::json;
use std::fmt::Display;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "qcode-sync")]
#[command(about = "Generate, check and migrate question identifiers across stores")]
struct Args {
    /// Path to the run configuration
    #[arg(short, long, default_value = "qcode-sync.toml")]
    config: PathBuf,

    /// Print reports as JSON on stdout
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Format compliance, duplicates, cross-store alignment, slot audit
    Check {
        /// Scheme to check against [default: scheme.current, else scheme.target]
        #[arg(long)]
        scheme: Option<SchemeVersion>,
    },

    /// Compute the migration mapping without touching any file
    Plan,

    /// Back up, rewrite and verify every store
    Migrate,

    /// Issue identifiers in the primary store
    Assign {
        /// Reissue every identifier instead of only blank or duplicated ones
        #[arg(long)]
        renumber: bool,
    },

    /// Fill or clear a derived-question slot
    Slot {
        #[command(subcommand)]
        action: SlotAction,
    },

    /// Create missing slot entries and refresh mirrored parent metadata
    SyncParents,

    /// List backups, or prune old ones
    Backups {
        /// Keep only the newest N backups of each store (backup.keep when N is omitted)
        #[arg(long, value_name = "N", num_args = 0..=1, default_missing_value = "0")]
        prune: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
enum SlotAction {
    Fill {
        parent: String,
        /// Slot tag, B1..B8
        tag: String,
        #[arg(long)]
        question: String,
        #[arg(long)]
        answer: String,
    },
    Clear {
        parent: String,
        tag: String,
    },
}

fn emit<T: Serialize + Display>(json: bool, value: &T) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", value);
    }
    Ok(())
}

fn emit_json(json: bool, value: serde_json::Value, text: String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", text);
    }
    Ok(())
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    info!("Using config {}", args.config.display());

    let mut sync = QcodeSync::open_file(&args.config)
        .with_context(|| format!("opening stores from {}", args.config.display()))?;

    let ok = match args.command {
        Command::Check { scheme } => {
            let scheme = scheme.unwrap_or_else(|| sync.active_scheme());
            let report = sync.check_against(scheme)?;
            emit(args.json, &report)?;
            report.is_healthy()
        }
        Command::Plan => {
            let report = sync.plan();
            emit(args.json, &report)?;
            report.is_success()
        }
        Command::Migrate => {
            let report = sync.migrate();
            emit(args.json, &report)?;
            report.is_success()
        }
        Command::Assign { renumber } => {
            let mode = if renumber {
                AssignMode::Renumber
            } else {
                AssignMode::MissingOnly
            };
            let report = sync.assign(mode)?;
            let text = report
                .assignments
                .iter()
                .map(|a| format!("{:>5}  {:<12} -> {}", a.index, a.old_qcode, a.new_qcode))
                .chain(std::iter::once(format!(
                    "Assigned {} of {} identifiers",
                    report.assignments.len(),
                    report.total_records
                )))
                .collect::<Vec<_>>()
                .join("\n");
            emit_json(args.json, serde_json::to_value(&report)?, text)?;
            true
        }
        Command::Slot { action } => match action {
            SlotAction::Fill {
                parent,
                tag,
                question,
                answer,
            } => {
                let outcome = sync.fill_slot(&parent, &tag, &question, &answer)?;
                let overwrote = matches!(outcome, FillOutcome::Overwrote(_));
                emit_json(
                    args.json,
                    json!({ "parent": parent, "tag": tag, "overwrote": overwrote }),
                    format!(
                        "{} {} {}",
                        if overwrote { "Overwrote" } else { "Filled" },
                        parent,
                        tag
                    ),
                )?;
                true
            }
            SlotAction::Clear { parent, tag } => {
                let previous = sync.clear_slot(&parent, &tag)?;
                emit_json(
                    args.json,
                    json!({ "parent": parent, "tag": tag, "was_filled": previous.exists }),
                    format!("Cleared {} {}", parent, tag),
                )?;
                true
            }
        },
        Command::SyncParents => {
            let report = sync.sync_parents()?;
            let text = format!(
                "{} created, {} refreshed, {} orphaned {:?}",
                report.created.len(),
                report.refreshed.len(),
                report.orphans.len(),
                report.orphans
            );
            emit_json(args.json, serde_json::to_value(&report)?, text)?;
            report.orphans.is_empty()
        }
        Command::Backups { prune: Some(keep) } => {
            let keep = if keep == 0 { None } else { Some(keep) };
            let removed = sync.prune_backups(keep)?;
            let text = removed
                .iter()
                .map(|p| format!("removed {}", p.display()))
                .chain(std::iter::once(format!("Pruned {} backups", removed.len())))
                .collect::<Vec<_>>()
                .join("\n");
            emit_json(args.json, json!({ "removed": removed }), text)?;
            true
        }
        Command::Backups { prune: None } => {
            let backups = sync.backups()?;
            let text = backups
                .iter()
                .flat_map(|(store, paths)| {
                    std::iter::once(format!("{} ({})", store, paths.len()))
                        .chain(paths.iter().map(|p| format!("  {}", p.display())))
                })
                .collect::<Vec<_>>()
                .join("\n");
            emit_json(args.json, serde_json::to_value(&backups)?, text)?;
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
