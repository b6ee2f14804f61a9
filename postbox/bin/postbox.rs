//! Postbox daemon and queue administration
//!
//! Without a subcommand, runs the dispatcher and archival loops until
//! interrupted. The other subcommands act directly on the configured store and
//! exit, so they may be used while a daemon is running against the same
//! SQLite database.

#[cfg(not(unix))]
compile_error!("Only unix is currently supported");

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use postbox::{Postbox, find_config_file};
use postbox_delivery::{ArchivalService, ConfigHandle, NewMessage, QueueService, Submission};
use postbox_store::{NewRecipient, QueueStatus, RecipientKind, RecordId, StoreConfig};

/// Database-backed mail queue processor
#[derive(Parser, Debug)]
#[command(name = "postbox")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to POSTBOX_CONFIG, then ./postbox.config.ron)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the queue processor (default)
    Run,
    /// Show record counts by status
    Stats,
    /// Queue a message
    Enqueue {
        #[arg(long)]
        from: String,
        #[arg(long)]
        subject: String,
        #[arg(long, required = true)]
        to: Vec<String>,
        #[arg(long)]
        cc: Vec<String>,
        #[arg(long)]
        bcc: Vec<String>,
        #[arg(long)]
        body: Option<String>,
        /// Lower is more urgent
        #[arg(long)]
        priority: Option<i32>,
        /// Hold until this RFC 3339 time
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Cancel a record that has not started processing
    Cancel { id: RecordId },
    /// Queue a fresh copy of a FAILED or CANCELLED record
    Resubmit { id: RecordId },
    /// Move every record with a terminal status to history, once
    Archive {
        #[arg(long, default_value = "SENT")]
        status: QueueStatus,
    },
    /// Show the archived attempts of a record
    History { id: RecordId },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = find_config_file(cli.config)?;
    let postbox = Postbox::load(&config_path)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => postbox.run(Some(config_path)).await,
        Command::Stats => cmd_stats(&service(&postbox)?).await,
        Command::Enqueue {
            from,
            subject,
            to,
            cc,
            bcc,
            body,
            priority,
            at,
        } => {
            let recipients = [
                (RecipientKind::To, to),
                (RecipientKind::Cc, cc),
                (RecipientKind::Bcc, bcc),
            ]
            .into_iter()
            .flat_map(|(kind, addresses)| {
                addresses
                    .into_iter()
                    .map(move |address| NewRecipient { address, kind })
            })
            .collect();

            let message = NewMessage {
                sender: from,
                subject,
                body,
                recipients,
                priority,
                scheduled_at: at,
                source: Some("cli".to_string()),
                ..NewMessage::default()
            };
            cmd_enqueue(&service(&postbox)?, message).await
        }
        Command::Cancel { id } => {
            service(&postbox)?.cancel(id).await?;
            println!("Cancelled record {id}");
            Ok(())
        }
        Command::Resubmit { id } => {
            let new_id = service(&postbox)?.resubmit(id).await?;
            println!("Record {id} resubmitted as {new_id}");
            Ok(())
        }
        Command::Archive { status } => cmd_archive(&postbox, status).await,
        Command::History { id } => cmd_history(&service(&postbox)?, id).await,
    }
}

fn service(postbox: &Postbox) -> anyhow::Result<QueueService> {
    if postbox.store == StoreConfig::Memory {
        eprintln!("Warning: the configured store is in-memory, changes will not persist");
    }
    let store = postbox.open_store()?;
    let config = ConfigHandle::new(postbox.queue.clone())?;
    Ok(QueueService::new(store, config))
}

fn join(ids: &[RecordId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

async fn cmd_stats(service: &QueueService) -> anyhow::Result<()> {
    let stats = service.stats().await?;

    println!("{:<12} {:>8}", "STATUS", "COUNT");
    println!("{}", "-".repeat(21));
    for status in QueueStatus::ALL {
        println!("{:<12} {:>8}", status.as_str(), stats.get(status));
    }
    println!("{}", "-".repeat(21));
    println!("{:<12} {:>8}", "TOTAL", stats.total);

    Ok(())
}

async fn cmd_archive(postbox: &Postbox, status: QueueStatus) -> anyhow::Result<()> {
    let store = service(postbox)?.store().clone();
    let config = ConfigHandle::new(postbox.queue.clone())?;
    let report = ArchivalService::new(store, config).archive(status).await?;

    println!("Archived {} {status} record(s)", report.count());
    if !report.missing_content.is_empty() {
        println!(
            "{} record(s) had no content: {}",
            report.missing_content.len(),
            join(&report.missing_content)
        );
    }
    Ok(())
}

async fn cmd_enqueue(service: &QueueService, message: NewMessage) -> anyhow::Result<()> {
    match service.submit(message).await? {
        Submission::Created(id) => println!("Queued record {id}"),
        Submission::Merged {
            id,
            recipients_added,
        } => println!("Grouped into record {id} ({recipients_added} new recipient(s))"),
    }
    Ok(())
}

async fn cmd_history(service: &QueueService, id: RecordId) -> anyhow::Result<()> {
    let entries = service.history(id).await?;
    if entries.is_empty() {
        println!("No history for record {id}");
        return Ok(());
    }

    println!(
        "{:<8} {:<10} {:>7} {:<25} {:<25}",
        "HISTORY", "STATUS", "RETRIES", "ARCHIVED", "SENT"
    );
    println!("{}", "-".repeat(79));
    for entry in &entries {
        let record = &entry.record;
        println!(
            "{:<8} {:<10} {:>7} {:<25} {:<25}",
            record.id.to_string(),
            record.status.as_str(),
            record.retry_count,
            record.archived_at.to_rfc3339(),
            record
                .sent_at
                .map_or_else(|| "-".to_string(), |at| at.to_rfc3339())
        );
        println!(
            "         {} recipient(s), {} attachment(s){}",
            entry.recipients.len(),
            entry.attachments.len(),
            record
                .error_message
                .as_deref()
                .map_or_else(String::new, |e| format!(", last error: {e}"))
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::try_parse_from(["postbox"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_archive_status_parses_case_insensitively() {
        let cli = Cli::try_parse_from(["postbox", "archive", "--status", "cancelled"]).expect("parse");
        assert!(matches!(
            cli.command,
            Some(Command::Archive {
                status: QueueStatus::Cancelled
            })
        ));
    }
}
