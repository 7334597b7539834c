//! `maintenance-agent` command line.
//!
//! `serve` exposes the tick endpoint over HTTP; `tick` runs one tick
//! in-process for cron callers. The remaining commands inspect and steer the
//! engine store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use maintenance_agent::autofix::revert_fix;
use maintenance_agent::db::FindingFilter;
use maintenance_agent::report::generate_report;
use maintenance_agent::server::serve;
use maintenance_agent::state::{load_config, AgentState};
use maintenance_agent::trigger::{handle_trigger, TriggerRequest};
use maintenance_agent::types::{FindingCategory, FindingStatus, Severity, TaskStatus};
use maintenance_agent::util::ts;

#[derive(Parser, Debug)]
#[command(
    name = "maintenance-agent",
    about = "Detects problems, schedules maintenance tasks, fixes data and proposes code changes",
    version
)]
struct Cli {
    /// Config file (defaults to ~/.maintenance-agent/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve POST /api/maintenance/tick and GET /healthz
    Serve {
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: SocketAddr,
    },
    /// Run one tick now, authenticated with the configured secret
    Tick {
        /// Run as a rate-limited manual trigger instead
        #[arg(long)]
        manual: bool,
    },
    /// Generate and print a report over the trailing window
    Report {
        /// Window length in hours (defaults to reportWindowHours)
        #[arg(long)]
        hours: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// List findings, newest first
    Findings {
        #[arg(long)]
        status: Option<FindingStatus>,
        #[arg(long)]
        category: Option<FindingCategory>,
        #[arg(long)]
        min_severity: Option<Severity>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// List tasks
    Tasks {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show the change plan stored for a proposal task
    Plan { task_id: String },
    /// Re-queue a failed task that still has attempts left
    Requeue { task_id: String },
    /// Undo a journaled auto-fix
    RevertFix { journal_id: String },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("Failed to load config")?;
    let state = Arc::new(AgentState::from_config(config).context("Failed to start engine")?);

    match cli.command {
        Command::Serve { addr } => serve(state, addr).await?,
        Command::Tick { manual } => {
            let request = if manual {
                TriggerRequest::manual()
            } else {
                match state.config.trigger_secret.as_deref() {
                    Some(secret) => TriggerRequest::bearer(secret),
                    None => bail!("No trigger secret configured; set MAINTENANCE_TRIGGER_SECRET or use --manual"),
                }
            };
            let response = handle_trigger(Arc::clone(&state), request, Utc::now()).await?;
            print_json(&response)?;
        }
        Command::Report { hours, json } => {
            let hours = hours.unwrap_or(state.config.report_window_hours);
            let db = state.lock_db();
            let (_, report) = generate_report(&db, Utc::now(), hours, state.config.executor.max_attempts)?;
            if json {
                print_json(&report)?;
            } else {
                println!("{}", report.to_text());
            }
        }
        Command::Findings {
            status,
            category,
            min_severity,
            limit,
        } => {
            let filter = FindingFilter {
                status,
                category,
                min_severity,
                since: None,
                limit: Some(limit),
            };
            print_json(&state.lock_db().list_findings(&filter)?)?;
        }
        Command::Tasks { status, limit } => {
            print_json(&state.lock_db().list_tasks(status, Some(limit))?)?;
        }
        Command::Plan { task_id } => match state.lock_db().get_change_plan(&task_id)? {
            Some(plan) => print_json(&plan)?,
            None => bail!("No change plan for task {}", task_id),
        },
        Command::Requeue { task_id } => {
            if state.lock_db().requeue_task(&task_id, state.config.executor.max_attempts)? {
                println!("Re-queued {}", task_id);
            } else {
                bail!("Task {} is not a failed task with attempts left", task_id);
            }
        }
        Command::RevertFix { journal_id } => {
            let Some(target) = state.target.as_ref() else {
                bail!("No target database configured");
            };
            let db = state.lock_db();
            let target = target.lock();
            let restored = revert_fix(&db, &target, &journal_id, &ts(Utc::now()))?;
            println!("Restored {} rows from {}", restored, journal_id);
        }
    }

    Ok(())
}
