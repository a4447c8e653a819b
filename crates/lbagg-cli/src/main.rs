use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lbagg_job::{GroupStatus, JobConfig, RunSummary};
use lbagg_storage::{DocumentStore, JsonFileStore};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "lbagg")]
#[command(about = "Group leaderboard aggregation job")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one aggregation pass now
    Run {
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run on the configured cron cadence until interrupted
    Schedule,
    /// Print a group's stored leaderboard
    Show {
        #[arg(long)]
        group: String,
        /// Also print the group's daily average for this date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = JobConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run { json: false }) {
        Commands::Run { json } => {
            let summary = lbagg_job::pipeline_from_config(config).run_once().await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serializing run summary")?
                );
            } else {
                print_summary(&summary);
            }
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                bail!("scheduler is disabled; set LBAGG_SCHEDULER_ENABLED=true");
            }
            let pipeline = Arc::new(lbagg_job::pipeline_from_config(config));
            let Some(mut sched) = lbagg_job::build_scheduler(Arc::clone(&pipeline)).await? else {
                bail!("scheduler is disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().cron, "scheduler started");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Show { group, date } => {
            let store = JsonFileStore::new(config.data_dir.clone());
            match store.get_current_leaderboard(&group).await? {
                Some(board) => {
                    println!("leaderboard {group} (generated {})", board.generated_at);
                    for (rank, entry) in board.entries.iter().enumerate() {
                        let updated = entry
                            .last_updated
                            .map(|ts| ts.to_rfc3339())
                            .unwrap_or_else(|| "never".to_string());
                        println!(
                            "{:>3}. {} ({}) {:.1} min, updated {}",
                            rank + 1,
                            entry.username,
                            entry.uid,
                            entry.total_minutes,
                            updated
                        );
                    }
                }
                None => println!("no leaderboard stored for {group}"),
            }
            if let Some(date) = date {
                match store.get_group_history(&group, &date).await? {
                    Some(record) => println!(
                        "average on {date}: {:.1} min (recorded {})",
                        record.value, record.recorded_at
                    ),
                    None => println!("no average recorded for {group} on {date}"),
                }
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    if summary.suppressed {
        println!(
            "run {} suppressed: quiet hours ({} local)",
            summary.run_id, summary.date_key
        );
        return;
    }

    println!(
        "run complete: run_id={} date={} groups={} updated={} skipped={} failed={}",
        summary.run_id,
        summary.date_key,
        summary.groups_seen,
        summary.updated,
        summary.skipped,
        summary.failed
    );
    for outcome in &summary.outcomes {
        match &outcome.status {
            GroupStatus::Updated {
                members,
                member_history_written,
                member_history_failed,
                group_average,
                ..
            } => println!(
                "- {}: updated {} members, history {}/{}, average {}",
                outcome.group_id,
                members,
                member_history_written,
                member_history_written + member_history_failed,
                group_average
                    .map(|v| format!("{v:.1}"))
                    .unwrap_or_else(|| "n/a".to_string())
            ),
            GroupStatus::Skipped { reason } => {
                println!("- {}: skipped ({reason:?})", outcome.group_id)
            }
            GroupStatus::Failed { error } => println!("- {}: failed: {error}", outcome.group_id),
        }
    }
}
