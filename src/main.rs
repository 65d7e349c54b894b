use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod engine;
mod error;
mod github;
mod lifecycle;
mod models;
mod policy;
mod report;
mod store;
mod tickets;

use engine::{DormancyEngine, SnapshotMode};
use github::{
    ActivitySource, CopilotSeatFetcher, CopilotSeatRemover, GithubClient, IssueTracker,
};
use lifecycle::{LifecycleConfig, NotificationLifecycle, DEFAULT_EXCLUSION_TAG};
use models::{ActivityRecord, Classification};
use policy::LoginWhitelist;
use store::ActivityStore;
use tickets::{ListingFinder, SearchFinder, TicketTracker};

#[derive(Parser)]
#[command(name = "dormancy-watch")]
#[command(about = "Track per-account activity and sweep dormant accounts", long_about = None)]
struct Cli {
    /// Path of the JSON state document
    #[arg(long, global = true, default_value = "dormancy.json")]
    state_file: PathBuf,

    /// Logical name of this dormancy check
    #[arg(long, global = true, default_value = "copilot-seats")]
    check: String,

    /// Inactivity threshold in days
    #[arg(long, global = true, default_value_t = 90)]
    threshold_days: i64,

    /// Login exempt from dormancy classification (repeatable)
    #[arg(long = "exempt", global = true, value_name = "LOGIN")]
    exempt: Vec<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch fresh activity and merge it into the state document
    Fetch {
        #[arg(long)]
        org: String,
        /// Override the fetch window start (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long, value_enum, default_value = "complete")]
        snapshot_mode: SnapshotMode,
        #[arg(long, value_enum, default_value = "most-recent")]
        activity_source: ActivitySource,
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the active/dormant summary
    Status,
    /// List accounts with their classification
    List {
        #[arg(long, value_enum)]
        only: Option<Classification>,
    },
    /// Notify, track, and remove dormant accounts via tracker tickets
    Sweep {
        #[arg(long)]
        org: String,
        /// Repository holding the notification issues, as owner/name
        #[arg(long)]
        repo: String,
        #[arg(long, default_value_t = 7)]
        grace_days: i64,
        #[arg(long)]
        assignee: Option<String>,
        /// Label that parks a ticket regardless of dormancy
        #[arg(long, default_value = DEFAULT_EXCLUSION_TAG)]
        exclusion_label: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Generate a markdown report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Export the account table as CSV, optionally the raw document as JSON
    Export {
        #[arg(long, default_value = "accounts.csv")]
        out: PathBuf,
        #[arg(long)]
        raw: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install log subscriber")?;

    let threshold = Duration::days(cli.threshold_days);
    let store = ActivityStore::new(&cli.state_file, &cli.check);

    match cli.command {
        Commands::Fetch {
            org,
            since,
            snapshot_mode,
            activity_source,
            dry_run,
        } => {
            let client = Arc::new(github_client()?);
            let engine = DormancyEngine::new(store, threshold, dry_run, snapshot_mode)
                .with_whitelist(Box::new(LoginWhitelist::new(cli.exempt.iter().cloned())))
                .with_fetcher(Box::new(CopilotSeatFetcher::new(
                    Arc::clone(&client),
                    &org,
                    activity_source,
                )))
                .with_removal_hook(Box::new(CopilotSeatRemover::new(client, &org)));

            let cycle = engine.fetch_activity(since).await?;
            println!(
                "Merged {} records, removed {} vanished accounts.",
                cycle.merged, cycle.removed
            );
        }
        Commands::Status => {
            let engine = local_engine(store, threshold, &cli.exempt);
            let summary = engine.summarize().await?;
            println!("Check: {}", cli.check);
            println!("Last activity fetch: {}", summary.last_activity_fetch);
            println!("Inactivity threshold: {} days", summary.threshold_days);
            println!("Total accounts: {}", summary.total_accounts);
            println!(
                "Active: {} ({:.2}%)",
                summary.active_accounts, summary.active_account_percentage
            );
            println!(
                "Dormant: {} ({:.2}%)",
                summary.dormant_accounts, summary.dormant_account_percentage
            );
        }
        Commands::List { only } => {
            let engine = local_engine(store, threshold, &cli.exempt);
            let (active, dormant) = engine.partition().await?;
            if only != Some(Classification::Dormant) {
                for rec in &active {
                    println!("active   {} (last active {})", rec.login, last_active(rec));
                }
            }
            if only != Some(Classification::Active) {
                for rec in &dormant {
                    println!("dormant  {} (last active {})", rec.login, last_active(rec));
                }
            }
        }
        Commands::Sweep {
            org,
            repo,
            grace_days,
            assignee,
            exclusion_label,
            dry_run,
        } => {
            let client = Arc::new(github_client()?);
            let engine = local_engine(store, threshold, &cli.exempt);
            let dormant = engine.list_dormant_accounts().await?;

            let tracker: Arc<dyn TicketTracker> =
                Arc::new(IssueTracker::new(Arc::clone(&client), &repo)?);
            let lifecycle = NotificationLifecycle::new(
                Arc::clone(&tracker),
                vec![
                    Box::new(SearchFinder::new(Arc::clone(&tracker))),
                    Box::new(ListingFinder::new(Arc::clone(&tracker))),
                ],
                Some(Box::new(CopilotSeatRemover::new(client, &org))),
                LifecycleConfig {
                    check: cli.check.clone(),
                    base_tags: vec!["dormancy".to_string(), cli.check.clone()],
                    exclusion_tag: exclusion_label,
                    grace_period: Duration::days(grace_days),
                    assignee,
                    dry_run,
                },
            );

            let sweep = lifecycle.process_dormant_accounts(&dormant).await?;
            println!("Swept {} dormant accounts:", dormant.len());
            println!("- notified: {}", sweep.notified.len());
            println!("- in grace period: {}", sweep.in_grace_period.len());
            println!("- removed: {}", sweep.removed.len());
            println!("- removal declined: {}", sweep.removal_declined.len());
            println!("- reactivated: {}", sweep.reactivated.len());
            println!("- excluded: {}", sweep.excluded.len());
            if !sweep.errors.is_empty() {
                println!("Errors:");
                for err in &sweep.errors {
                    println!("- {}: {}", err.login, err.message);
                }
            }
        }
        Commands::Report { out } => {
            let engine = local_engine(store, threshold, &cli.exempt);
            let summary = engine.summarize().await?;
            let (active, dormant) = engine.partition().await?;
            let report = report::build_report(&cli.check, &summary, &active, &dormant);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Export { out, raw } => {
            let engine = local_engine(store, threshold, &cli.exempt);
            if let Some(path) = raw {
                let document = engine.store().raw_document().await?;
                std::fs::write(&path, serde_json::to_string_pretty(&document)?)?;
                println!("Raw document written to {}.", path.display());
            }
            let (active, dormant) = engine.partition().await?;
            let file = std::fs::File::create(&out)
                .with_context(|| format!("creating {}", out.display()))?;
            report::write_csv(file, &active, &dormant)?;
            println!("Accounts exported to {}.", out.display());
        }
    }

    Ok(())
}

fn github_client() -> anyhow::Result<GithubClient> {
    let token = std::env::var("GITHUB_TOKEN")
        .context("GITHUB_TOKEN must be set to a token with org and issues access")?;
    Ok(GithubClient::new(token))
}

fn local_engine(store: ActivityStore, threshold: Duration, exempt: &[String]) -> DormancyEngine {
    let mut engine = DormancyEngine::new(store, threshold, false, SnapshotMode::Partial);
    if !exempt.is_empty() {
        engine = engine.with_whitelist(Box::new(LoginWhitelist::new(exempt.iter().cloned())));
    }
    engine
}

fn last_active(rec: &ActivityRecord) -> String {
    rec.last_activity
        .map(|ts| ts.to_string())
        .unwrap_or_else(|| "never".to_string())
}
