mod clock;
mod config;
mod github;
mod pipeline;
mod ratelimit;
mod sheets;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::clock::SystemClock;
use crate::github::client::{HttpGithubClient, WorkflowClient};
use crate::pipeline::coordinator::PipelineCoordinator;
use crate::pipeline::events::PipelineEvent;
use crate::pipeline::{DownloadLink, PipelineError};
use crate::ratelimit::RateLimiter;
use crate::ratelimit::store::FileStateStore;
use crate::sheets::client::HttpSheetsClient;
use crate::sheets::models::Article;

#[derive(Parser)]
#[command(name = "roundup", about = "Trigger and collect the reading roundup pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Trigger a new pipeline run (subject to the cooldown)
    Run {
        /// Stay running until the scheduled result fetch has completed
        #[arg(long)]
        wait: bool,
        /// Ask the workflow to run in test mode
        #[arg(long)]
        test_mode: bool,
    },
    /// Show pipeline state and cooldown
    Status,
    /// Fetch and show the latest results
    Results {
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show where to download the latest report
    Download,
    /// Clear a run stuck in "running"
    Clear,
    /// Delete all persisted rate-limit data
    Reset,
    /// List recent workflow runs on the automation platform
    Runs {
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Dump rate-limit state as JSON
    Debug,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv().ok();
    let cli = Cli::parse();
    let mut config = config::Config::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("roundup=info,reqwest=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    if let Command::Run { test_mode: true, .. } = cli.command {
        config.github.test_mode = true;
    }

    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    let workflow: Arc<dyn WorkflowClient> =
        Arc::new(HttpGithubClient::new(http_client.clone(), config.github.clone()));
    let results = Arc::new(HttpSheetsClient::new(http_client, config.sheets.clone()));

    let limiter = RateLimiter::new(
        Arc::new(FileStateStore::new(&config.data_dir)),
        Arc::new(SystemClock),
    )
    .with_stale_after(config.stale_after);
    let coordinator =
        PipelineCoordinator::new(limiter, workflow.clone(), results, config.fetch_window);

    let events = coordinator.subscribe();
    let printer = tokio::spawn(print_events(events));

    let outcome = run_command(cli.command, &coordinator, workflow.as_ref()).await;

    drop(coordinator);
    let _ = printer.await;

    // `_guard` has to drop before the process ends so sentry flushes
    Ok(ExitCode::from(exit_status(&outcome)))
}

fn exit_status(outcome: &Result<()>) -> u8 {
    match outcome {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    }
}

async fn run_command(
    command: Command,
    coordinator: &PipelineCoordinator,
    workflow: &dyn WorkflowClient,
) -> Result<()> {
    match command {
        Command::Run { wait, .. } => {
            coordinator.request_run().await?;
            let mins = coordinator.fetch_window().as_secs().div_ceil(60);
            if !wait {
                println!(
                    "Pipeline triggered. Results should be ready in about {mins} minutes; \
                     check with `roundup results`."
                );
                return Ok(());
            }

            println!("Pipeline triggered. Waiting {mins} minutes before fetching results...");
            coordinator.wait_for_scheduled_fetch().await;
            let articles = coordinator.articles();
            if articles.is_empty() {
                anyhow::bail!(PipelineError::NoResults);
            }
            print_articles(&articles, coordinator.last_run_time());
        }
        Command::Status => {
            let decision = coordinator.run_decision();
            println!("Status:     {}", coordinator.current_status());
            println!("Can run:    {}", if decision.can_run { "yes" } else { "no" });
            println!("Reason:     {}", decision.reason);
            println!("Available:  {}", coordinator.remaining_time());
            if let Some(next) = decision.next_available_time {
                println!("Next run:   {}", next.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"));
            }
            match workflow.latest_run_status().await {
                Ok(Some(run)) => println!(
                    "Last job:   {} / {} (started {}, updated {})",
                    run.status.as_deref().unwrap_or("-"),
                    run.conclusion.as_deref().unwrap_or("-"),
                    run.created_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
                    run.updated_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
                ),
                Ok(None) => println!("Last job:   none"),
                Err(e) => tracing::debug!(error = %e, "Could not read workflow runs"),
            }
        }
        Command::Results { json } => {
            let articles = coordinator.request_view_results().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&articles)?);
            } else {
                print_articles(&articles, coordinator.last_run_time());
            }
        }
        Command::Download => {
            let link = coordinator.request_download().await?;
            if let DownloadLink::Artifact(artifact) = &link {
                println!("Artifact: {} (run #{})", artifact.name, artifact.run_number);
            }
            println!("Download: {}", link.url());
            if let DownloadLink::Report(report) = &link {
                println!("View:     {}", report.view_link);
                if let Some(updated) = &report.updated_at {
                    println!("Updated:  {updated}");
                }
            }
        }
        Command::Clear => {
            if coordinator.manual_clear_running() {
                println!("Cleared running state. Cooldown: {}", coordinator.remaining_time());
            } else {
                println!("Pipeline was not marked as running; nothing to clear.");
            }
        }
        Command::Reset => {
            coordinator.reset();
            println!("Rate limit data cleared.");
        }
        Command::Runs { limit } => {
            let runs = workflow
                .list_workflow_runs(limit)
                .await
                .context("failed to list workflow runs")?;
            if runs.is_empty() {
                println!("No workflow runs found.");
            }
            for run in runs {
                let marker = if run.is_active() { "*" } else { " " };
                println!(
                    "{marker} #{:<5} {:<28} {:<12} {:<10} {}",
                    run.run_number,
                    run.name.as_deref().unwrap_or("-"),
                    run.status.as_deref().unwrap_or("-"),
                    run.conclusion.as_deref().unwrap_or("-"),
                    run.created_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
                );
            }
        }
        Command::Debug => {
            println!("{}", serde_json::to_string_pretty(&coordinator.debug_info())?);
        }
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<PipelineEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let marker = if event.kind.is_failure() { "!" } else { "*" };
                eprintln!("{marker} {}", event.message);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "Event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_articles(articles: &[Article], last_run: Option<chrono::DateTime<chrono::Utc>>) {
    if let Some(last_run) = last_run {
        println!(
            "Last run: {}\n",
            last_run.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M")
        );
    }
    for article in articles {
        println!("{} | {} ({})", article.title, article.publication, article.journalist);
        println!("  {}", article.url);
        println!("  {}\n", article.summary);
    }
    println!("{} articles", articles.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_reflects_outcome() {
        assert_eq!(exit_status(&Ok(())), 0);
        assert_eq!(exit_status(&Err(PipelineError::NoResults.into())), 1);
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from(["roundup", "run", "--wait", "--test-mode"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Run {
                wait: true,
                test_mode: true
            }
        ));
    }
}
