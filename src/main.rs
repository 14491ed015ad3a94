//! ledger-sync - reconcile a YNAB budget with a Splitwise group
//!
//! Commands run one user, every configured user, the periodic scheduler, or the
//! HTTP API. Configuration comes from `ledger-sync.toml`.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use ledger_sync::app::App;
use ledger_sync::config::AppConfig;
use ledger_sync::history::RunTrigger;
use ledger_sync::report::SyncResponse;
use ledger_sync::request::SyncRequest;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ledger-sync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync one user, from the config file or a JSON request
    Run {
        /// Configured user id
        user_id: Option<String>,
        /// JSON file holding a full sync request
        #[arg(long, conflicts_with = "user_id")]
        request: Option<PathBuf>,
    },

    /// Sync every configured user once
    RunAll,

    /// Sync every configured user on the configured interval
    Schedule,

    /// Serve the HTTP API
    #[cfg(feature = "api")]
    Serve {
        /// Also run the scheduler in the background
        #[arg(long)]
        with_scheduler: bool,
    },

    /// Show recent runs for a user
    History {
        user_id: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Check the config file and every configured user
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate => validate(&config),
        Commands::Run { user_id, request } => run_one(config, user_id, request).await,
        Commands::RunAll => run_all(config).await,
        Commands::Schedule => {
            let app = App::open(config)?;
            let profiles = app.config.user_profiles()?;
            if profiles.is_empty() {
                bail!("No users configured");
            }
            app.orchestrator.clone().run_scheduler(profiles).await;
            Ok(())
        }
        #[cfg(feature = "api")]
        Commands::Serve { with_scheduler } => serve(config, with_scheduler).await,
        Commands::History { user_id, limit } => history(config, &user_id, limit),
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    let profiles = config.user_profiles()?;
    println!("Configuration OK: {} users", profiles.len());
    for profile in profiles {
        println!(
            "  {} (tier {:?}, state {})",
            profile.user_id, profile.tier, profile.state_backend
        );
    }
    Ok(())
}

fn print_response(response: &SyncResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}

async fn run_one(config: AppConfig, user_id: Option<String>, request: Option<PathBuf>) -> Result<()> {
    let profile = match (user_id, request) {
        (_, Some(path)) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read request {}", path.display()))?;
            let request: SyncRequest = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse request {}", path.display()))?;
            request.validate()?
        }
        (Some(user_id), None) => config
            .user_profiles()?
            .into_iter()
            .find(|profile| profile.user_id == user_id)
            .ok_or_else(|| anyhow!("User '{}' is not configured", user_id))?,
        (None, None) => bail!("Pass a user id or --request"),
    };

    let app = App::open(config)?;
    let response = match app.orchestrator.sync_user(&profile, RunTrigger::Manual).await {
        Ok(run) => SyncResponse::from_run(&run),
        Err(err) => SyncResponse::from_error(Some(&profile.user_id), &err),
    };
    print_response(&response)?;
    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_all(config: AppConfig) -> Result<()> {
    let app = App::open(config)?;
    let profiles = app.config.user_profiles()?;
    let responses = app
        .orchestrator
        .sync_all(&profiles, RunTrigger::Manual)
        .await;
    println!("{}", serde_json::to_string_pretty(&responses)?);
    if responses.iter().any(|r| !r.success) {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(feature = "api")]
async fn serve(config: AppConfig, with_scheduler: bool) -> Result<()> {
    use ledger_sync::api::{ApiServer, AppState};

    let app = App::open(config)?;
    let profiles = app.config.user_profiles()?;
    if with_scheduler {
        let orchestrator = app.orchestrator.clone();
        let scheduled = profiles.clone();
        tokio::spawn(async move { orchestrator.run_scheduler(scheduled).await });
    }

    let state = AppState::new(app.orchestrator.clone(), app.rate_limiter.clone(), profiles);
    ApiServer::new(app.config.api.clone(), state).run().await
}

fn history(config: AppConfig, user_id: &str, limit: usize) -> Result<()> {
    let app = App::open(config)?;
    let runs = app.recorder().list_runs(user_id, limit)?;
    if runs.is_empty() {
        println!("No runs recorded for {}", user_id);
        return Ok(());
    }
    for run in runs {
        let moved = run.items.iter().filter(|item| item.is_success()).count();
        println!(
            "{}  {}  {:<11} {:<9} moved {}/{}{}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.id,
            run.status.as_str(),
            run.trigger.as_str(),
            moved,
            run.items.len(),
            run.error
                .as_deref()
                .map(|e| format!("  ({e})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}
