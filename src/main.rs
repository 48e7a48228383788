use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use batchwork::{
    admin::{Admin, CancelOutcome, render_table},
    app::ComponentRegistry,
    config::Config,
    observability,
    runner::RunnerRegistry,
    scheduler::CrontabRescheduler,
    store::{
        dao::{SqliteWorkDao, WorkStatus},
        models::WorkFilter,
    },
};

/// Inspect and manage batch works recorded on this host.
#[derive(Debug, Parser)]
#[command(name = "batchwork", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show one work as JSON, with any transfer in progress.
    Get { id: Uuid },
    /// List works, newest first.
    List {
        #[arg(long)]
        status: Vec<WorkStatus>,
        #[arg(long)]
        name: Vec<String>,
        #[arg(long)]
        id: Vec<Uuid>,
        /// RFC 3339 timestamp.
        #[arg(long)]
        created_after: Option<DateTime<Utc>>,
    },
    /// Kill any running invocation, unregister it and delete the record.
    Delete { id: Uuid },
    /// Cancel a work that has not finished yet.
    Cancel { id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;
    observability::init(config.log_format())?;
    observability::install_panic_hook();

    tokio::fs::create_dir_all(config.data_dir())
        .await
        .with_context(|| format!("failed to create {}", config.data_dir().display()))?;
    let dao = Arc::new(
        SqliteWorkDao::connect(&config.db_path())
            .await
            .context("failed to open work store")?,
    );
    let admin = Admin::new(
        dao,
        Arc::new(CrontabRescheduler::new(config.log_dir())),
        config.lock_dir(),
    );

    match cli.command {
        Command::Get { id } => {
            let work = admin.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&work)?);
            for row in admin.progress(id).await? {
                println!(
                    "pid {}: {} {}/{} bytes (at {})",
                    row.pid,
                    row.description,
                    row.current,
                    row.total,
                    row.updated_at.to_rfc3339()
                );
            }
        }
        Command::List {
            status,
            name,
            id,
            created_after,
        } => {
            let filter = WorkFilter {
                ids: id,
                statuses: status,
                names: name,
                created_after,
            };
            print!("{}", render_table(&admin.list(&filter).await?));
        }
        Command::Delete { id } => {
            let work = admin.delete(id).await?;
            println!("deleted {} ({})", work.id, work.status);
        }
        Command::Cancel { id } => {
            // Clean-up of an idle work talks to the service, so this needs the full stack.
            let registry = ComponentRegistry::build(config, RunnerRegistry::new())
                .await
                .context("failed to build component registry")?;
            let engine = registry.engine(CancellationToken::new());
            match admin.cancel(&engine, id).await? {
                CancelOutcome::Signalled { pid } => {
                    println!("asked pid {pid} to cancel {id}");
                }
                CancelOutcome::Canceled(work) => {
                    println!("canceled {} ({})", work.id, work.status);
                }
            }
        }
    }

    Ok(())
}
