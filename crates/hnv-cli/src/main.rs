use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use hnv_adapters::HttpHnApi;
use hnv_core::RunOutcome;
use hnv_storage::Store;
use hnv_sync::{build_scheduler, run_backup, system_status, HnvConfig, Refresher};
use hnv_web::AppState;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "hnv-cli")]
#[command(about = "HackerNews Viewer command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one refresh cycle and exit.
    Refresh,
    /// Serve the JSON API.
    Serve {
        /// Also run scheduled refreshes and backups in this process.
        #[arg(long)]
        schedule: bool,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Snapshot the database into the backup directory.
    Backup,
    Migrate,
    /// Print the status report as JSON.
    Status,
    /// Fetch one user profile, including submissions.
    User { handle: String },
    /// Run scheduled refreshes and backups until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging();
    let config = HnvConfig::load().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Refresh) {
        Commands::Refresh => {
            let refresher = build_refresher(&config).await?;
            let run = refresher.run_cycle().await?;
            let outcome = run.outcome.unwrap_or(RunOutcome::Failed);
            println!(
                "refresh complete: run_id={} outcome={} stories={} comments={} errors={}",
                run.id,
                outcome.as_str(),
                run.stories_refreshed,
                run.comments_refreshed,
                run.errors.len()
            );
            if outcome == RunOutcome::Failed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Serve { schedule, port } => {
            let refresher = build_refresher(&config).await?;
            let state = AppState::new(refresher.store().clone(), &config)
                .with_refresher(Arc::clone(&refresher));
            let scheduler = if schedule {
                let sched = build_scheduler(Arc::clone(&refresher), &config).await?;
                sched.start().await.context("starting scheduler")?;
                Some(sched)
            } else {
                None
            };
            hnv_web::serve(state, port.unwrap_or(config.web_port)).await?;
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Backup => {
            let store = open_store(&config).await?;
            let record = run_backup(&store, &config.backup_dir(), config.backup_keep).await?;
            println!(
                "backup complete: {} ({} bytes)",
                record.path.display(),
                record.size_bytes
            );
        }
        Commands::Migrate => {
            // opening applies pending migrations
            let store = open_store(&config).await?;
            println!("migrations applied: {}", config.database_path().display());
            store.health_check().await?;
        }
        Commands::Status => {
            let store = open_store(&config).await?;
            let status = system_status(&store, false, config.refresh_interval(), Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::User { handle } => {
            let refresher = build_refresher(&config).await?;
            let user = refresher.refresh_user(&handle).await?;
            println!(
                "user {}: karma={} submissions={}",
                user.handle,
                user.karma,
                user.submitted.as_ref().map_or(0, Vec::len)
            );
        }
        Commands::Schedule => {
            let refresher = build_refresher(&config).await?;
            let mut sched = build_scheduler(refresher, &config).await?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("HNV_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn open_store(config: &HnvConfig) -> Result<Store> {
    let path = config.database_path();
    Store::open(&path)
        .await
        .with_context(|| format!("opening store at {}", path.display()))
}

async fn build_refresher(config: &HnvConfig) -> Result<Arc<Refresher>> {
    let store = open_store(config).await?;
    let api = HttpHnApi::new(config.api_base_url.clone(), config.http_client_config())?;
    Ok(Arc::new(Refresher::new(
        Arc::new(api),
        store,
        config.refresh_settings(),
    )))
}
