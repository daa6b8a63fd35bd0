use anchorsafe_core::{EntityKind, ResourceKind};
use anchorsafe_sync::{format_process_time, LocalStore, RefreshOutcome, SyncConfig, SyncPipeline};
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "anchorsafe-cli")]
#[command(about = "AnchorSafe <-> SimPro sync command-line interface")]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch changed data from SimPro and add new rows locally.
    Refresh {
        #[arg(long, default_value = "all")]
        get: String,
        #[arg(long)]
        uid: Option<i64>,
    },
    /// Refresh the JSON cache only.
    Fetch {
        #[arg(long, default_value = "all")]
        get: String,
        /// Ignore LastUpdated and fetch everything.
        #[arg(long)]
        full: bool,
    },
    /// Show when each cache file was last refreshed.
    LastRefresh,
    Migrate,
    Serve,
}

fn init_tracing(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let command = cli.command.unwrap_or(Commands::Refresh {
        get: "all".to_string(),
        uid: None,
    });

    match command {
        Commands::Refresh { get, uid } => {
            let Some(entities) = EntityKind::select(&get) else {
                bail!("unknown selection `{get}` (expected all, clients, sites, locations or inspections)");
            };
            let pipeline = SyncPipeline::connect(SyncConfig::from_env()).await?;
            match pipeline.data_refresh(&entities, uid).await? {
                RefreshOutcome::Refreshed { counts, elapsed } => println!(
                    "refresh complete: clients={} sites={} locations={} inspections={} time={}",
                    counts.clients,
                    counts.sites,
                    counts.locations,
                    counts.inspections,
                    format_process_time(elapsed)
                ),
                RefreshOutcome::NoData { elapsed } => {
                    println!("refresh fetched no data (time={})", format_process_time(elapsed))
                }
            }
        }
        Commands::Fetch { get, full } => {
            let Some(kinds) = ResourceKind::select(&get) else {
                bail!("unknown selection `{get}` (expected all, jobs, customers, employees, sites or assets)");
            };
            let pipeline = SyncPipeline::connect(SyncConfig::from_env()).await?;
            let report = pipeline.fetcher().get_data(&kinds, 1, !full).await?;
            for (kind, written) in &report.resources {
                println!("{kind}: {}", if *written { "updated" } else { "no new items" });
            }
        }
        Commands::LastRefresh => {
            let pipeline = SyncPipeline::connect(SyncConfig::from_env()).await?;
            let stamps = pipeline.last_data_refresh().await?;
            if stamps.is_empty() {
                println!("no cache files yet");
            }
            for (label, stamp) in stamps {
                println!("{label}: {}", stamp.to_rfc3339());
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            LocalStore::connect(&config.database_url).await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Serve => {
            anchorsafe_web::serve_from_env().await?;
        }
    }

    Ok(())
}
