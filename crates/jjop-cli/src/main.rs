use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jjop_adapters::JustJoinApi;
use jjop_storage::{HttpClientConfig, ObjectStore, ProxyPool};
use jjop_sync::migrate::{connect, run_migrations};
use jjop_sync::{
    landing_writer, notifier_for, open_object_store, remote_database, run_fetch, run_synced_import,
    ship_run_log, FetchOptions, Notifier, PipelineConfig, RunKind, SyncedRun,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jjop")]
#[command(about = "Job offer landing zone and normalized store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Page through the listing API into date-partitioned landing files.
    Fetch {
        #[arg(long, default_value_t = 1)]
        start_page: u64,
        #[arg(long, default_value_t = 100)]
        per_page: u64,
        #[arg(long, default_value_t = 50)]
        max_pages: u64,
        /// Upper bound of the random pause between pages.
        #[arg(long, default_value_t = 100)]
        page_delay_secs: u64,
        #[arg(long, default_value_t = 2)]
        failure_budget: u32,
        #[arg(long, default_value_t = 100)]
        failure_cooldown_secs: u64,
    },
    /// Import settled landing files into the remote database.
    Import,
    /// Create or update the schema of the remote database.
    Migrate,
}

async fn fetch(
    config: &PipelineConfig,
    store: Arc<dyn ObjectStore>,
    opts: FetchOptions,
    notifier: &dyn Notifier,
) -> Result<()> {
    let writer = landing_writer(config, store);
    let proxies = Arc::new(ProxyPool::new(config.proxy_list_url.clone(), config.proxy_refresh));
    let http = HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: config.user_agent.clone(),
        ..Default::default()
    };
    let api = JustJoinApi::connect(http, Some(proxies), config.api_url.clone())?;

    match run_fetch(&api, &writer, &opts).await {
        Ok(summary) => {
            notifier.notify(&format!("Fetch finished: {summary}")).await;
            println!("{summary}");
            Ok(())
        }
        Err(err) => {
            notifier.notify(&format!("Fetch failed: {err:#}")).await;
            Err(err)
        }
    }
}

async fn import(config: &PipelineConfig, store: Arc<dyn ObjectStore>, notifier: &dyn Notifier) -> Result<()> {
    let SyncedRun { output, write_back } = match run_synced_import(config, store).await {
        Ok(run) => run,
        Err(err) => {
            notifier.notify(&format!("Import aborted: {err:#}")).await;
            return Err(err);
        }
    };

    match &output {
        Ok(summary) => notifier.notify(&format!("Import finished: {summary}")).await,
        Err(err) => notifier.notify(&format!("Import failed: {err:#}")).await,
    }
    if let Err(err) = &write_back {
        notifier
            .notify(&format!("Database upload failed, results kept locally: {err:#}"))
            .await;
    }

    let summary = output?;
    let backup = write_back.context("database write-back failed")?;
    if let Some(key) = backup {
        info!(backup = %key, "previous database kept");
    }
    println!("{summary}");
    Ok(())
}

async fn migrate(config: &PipelineConfig, store: Arc<dyn ObjectStore>) -> Result<()> {
    let run = remote_database(config, store)
        .with_synced_database(|path| async move {
            let pool = connect(&path).await?;
            let result = run_migrations(&pool).await;
            pool.close().await;
            result
        })
        .await?;
    run.output?;
    run.write_back.context("database write-back failed")?;
    println!("schema up to date at {}", config.db_key);
    Ok(())
}

fn open_run_log(path: &Path) -> std::io::Result<Arc<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(file))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    let run_log = match open_run_log(&config.log_file) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("run log {} disabled: {err}", config.log_file.display());
            None
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(run_log.map(|file| tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file)))
        .init();

    let notifier = notifier_for(config.webhook_url.as_deref());
    let store = open_object_store(&config)?;

    let (result, kind) = match cli.command {
        Commands::Fetch {
            start_page,
            per_page,
            max_pages,
            page_delay_secs,
            failure_budget,
            failure_cooldown_secs,
        } => {
            let opts = FetchOptions {
                start_page,
                per_page,
                max_pages,
                page_delay_max: Duration::from_secs(page_delay_secs),
                failure_budget,
                failure_cooldown: Duration::from_secs(failure_cooldown_secs),
            };
            let result = fetch(&config, store.clone(), opts, notifier.as_ref()).await;
            (result, RunKind::Fetch)
        }
        Commands::Import => (import(&config, store.clone(), notifier.as_ref()).await, RunKind::Import),
        Commands::Migrate => (migrate(&config, store.clone()).await, RunKind::Import),
    };

    if let Err(err) = &result {
        error!(error = %format!("{err:#}"), "run failed");
    }
    if let Err(err) = ship_run_log(&config, store.as_ref(), kind).await {
        warn!(error = %format!("{err:#}"), "run log upload failed");
    }
    result
}
