//! `strata` operator CLI
//!
//! Opens a data directory, replays its journal, runs one operation and
//! prints the result as JSON on stdout. Logs go to stderr.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::{document_from_value, Actor, ContextLevel, Document, EntityKey, StrataConfig};
use strata_service::{ContextService, DelegationId, DelegationStatus, GetOptions};
use strata_sync::LocalOnly;
use tracing_subscriber::EnvFilter;

/// Hierarchical context store
#[derive(Debug, Parser)]
#[command(name = "strata", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding the journal (overrides the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Identity recorded on writes
    #[arg(long, global = true, env = "STRATA_ACTOR", default_value = "cli")]
    actor: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a record
    Create {
        /// Level: global, project, branch or task
        level: ContextLevel,
        /// Entity id
        id: String,
        /// Parent id at the next less specific level
        #[arg(long)]
        parent: Option<String>,
        /// JSON object with the initial data
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Read a record
    Get {
        /// Level of the record
        level: ContextLevel,
        /// Entity id
        id: String,
        /// Only the record's own data, without ancestors
        #[arg(long)]
        own: bool,
    },
    /// Merge a JSON object into a record
    Update {
        /// Level of the record
        level: ContextLevel,
        /// Entity id
        id: String,
        /// JSON object with the keys to overwrite
        #[arg(long)]
        data: String,
    },
    /// Delete a record without children
    Delete {
        /// Level of the record
        level: ContextLevel,
        /// Entity id
        id: String,
    },
    /// List the direct children of a record
    Children {
        /// Level of the record
        level: ContextLevel,
        /// Entity id
        id: String,
    },
    /// Propose a pattern to an ancestor, optionally approving it at once
    Delegate {
        /// Level of the source record
        level: ContextLevel,
        /// Source entity id
        id: String,
        /// Target level (less specific than the source)
        #[arg(long)]
        to: ContextLevel,
        /// JSON object with the pattern
        #[arg(long)]
        data: String,
        /// Approve immediately
        #[arg(long)]
        approve: bool,
    },
    /// Approve a pending delegation and merge its pattern
    Approve {
        /// Delegation id
        id: DelegationId,
    },
    /// Reject a pending delegation
    Reject {
        /// Delegation id
        id: DelegationId,
        /// Why the pattern is not taken over
        #[arg(long)]
        reason: Option<String>,
    },
    /// List delegations, oldest first
    Delegations {
        /// Only those still waiting for a decision
        #[arg(long)]
        pending: bool,
    },
    /// Show journal sync state
    Status,
    /// Push every unsynced journal entry now
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = match &cli.config {
        Some(path) => StrataConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StrataConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }
    if config.data_dir.is_none() {
        tracing::warn!("no data directory configured, changes will not persist");
    }

    let service =
        ContextService::open(config, Arc::new(LocalOnly))
            .context("opening context service")?;
    let actor = Actor::new(cli.actor);

    match cli.command {
        Command::Create {
            level,
            id,
            parent,
            data,
        } => {
            let data = parse_document(&data)?;
            let record = service
                .create(EntityKey::new(level, id), parent, data, &actor)
                .await?;
            print_json(&record)?;
        }
        Command::Get { level, id, own } => {
            let options = if own {
                GetOptions::own_only()
            } else {
                GetOptions::default()
            };
            let view = service.get(&EntityKey::new(level, id), options).await?;
            print_json(&view)?;
        }
        Command::Update { level, id, data } => {
            let record = service
                .update(&EntityKey::new(level, id), parse_document(&data)?, &actor)
                .await?;
            print_json(&record)?;
        }
        Command::Delete { level, id } => {
            let record = service.delete(&EntityKey::new(level, id), &actor).await?;
            print_json(&record)?;
        }
        Command::Children { level, id } => {
            print_json(&service.children(&EntityKey::new(level, id)))?;
        }
        Command::Delegate {
            level,
            id,
            to,
            data,
            approve,
        } => {
            let mut delegation = service.propose_delegation(
                EntityKey::new(level, id),
                to,
                parse_document(&data)?,
                &actor,
            )?;
            if approve {
                delegation = service.approve(delegation.id, &actor).await?;
            }
            print_json(&delegation)?;
        }
        Command::Approve { id } => {
            print_json(&service.approve(id, &actor).await?)?;
        }
        Command::Reject { id, reason } => {
            print_json(&service.reject(id, &actor, reason).await?)?;
        }
        Command::Delegations { pending } => {
            let status = pending.then_some(DelegationStatus::Pending);
            print_json(&service.delegations(status))?;
            return Ok(());
        }
        Command::Status => {
            let health = service.sync_health();
            print_json(&serde_json::json!({
                "remote": health.remote,
                "pending": health.counts.pending,
                "failed": health.counts.failed,
                "synced": health.counts.synced,
                "degraded": health
                    .warnings
                    .iter()
                    .map(|w| serde_json::json!({
                        "seq": w.seq,
                        "key": w.key,
                        "attempts": w.attempts,
                        "last_error": w.last_error,
                    }))
                    .collect::<Vec<_>>(),
            }))?;
            return Ok(());
        }
        Command::Sync => {}
    }

    let report = service.sync_now().await?;
    tracing::info!(
        synced = report.synced,
        failed = report.failed,
        deferred = report.deferred,
        "journal pushed"
    );
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn parse_document(text: &str) -> Result<Document> {
    let value: serde_json::Value = serde_json::from_str(text)
        .context("data is not valid JSON")?;
    match document_from_value(value) {
        Some(document) => Ok(document),
        None => bail!("data must be a JSON object"),
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
