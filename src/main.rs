use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use strava_ingest::auth::refresh_access_token;
use strava_ingest::config::Config;
use strava_ingest::dashboard::{self, DashboardFilter};
use strava_ingest::http::build_client;
use strava_ingest::mirror::write_csv;
use strava_ingest::pipeline::{Pipeline, RunOptions};
use strava_ingest::warehouse::{AnyWarehouse, Warehouse};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "strava-ingest")]
#[command(author, version, about = "Strava activities into a warehouse, a CSV mirror and a dashboard", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true, env = "STRAVA_INGEST_CONFIG", default_value = "config/config.yaml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, normalize, enrich, load the warehouse and mirror the CSV
    Run {
        /// Leave city/state/country empty
        #[arg(long)]
        skip_geocode: bool,
        /// Do not write the local CSV or upload to Drive
        #[arg(long)]
        skip_mirror: bool,
        /// Stop before the warehouse load
        #[arg(long)]
        dry_run: bool,
    },
    /// Summaries and activity table from the warehouse
    Dashboard {
        /// First day (YYYY-MM-DD), defaults to the earliest activity
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day (YYYY-MM-DD), defaults to the latest activity
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Activity type; repeat for several, "(All)" for no filter
        #[arg(long = "type")]
        types: Vec<String>,
        /// City; repeat for several, "(All)" for no filter
        #[arg(long = "city")]
        cities: Vec<String>,
    },
    /// Fetch and normalize, then write the CSV without touching the warehouse
    Export {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// Leave city/state/country empty
        #[arg(long)]
        skip_geocode: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,strava_ingest=debug,sqlx=warn")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    info!("Configuration loaded from {}", cli.config.display());

    let work = async {
        match cli.command {
            Commands::Run {
                skip_geocode,
                skip_mirror,
                dry_run,
            } => {
                let options = RunOptions {
                    skip_geocode,
                    skip_mirror,
                    dry_run,
                };
                let report = Pipeline::run(&config, options).await?;
                info!(
                    "Run finished: fetched={} normalized={} loaded={:?} drive={:?}",
                    report.fetched, report.normalized, report.loaded, report.drive
                );
                Ok::<(), anyhow::Error>(())
            }
            Commands::Dashboard {
                from,
                to,
                types,
                cities,
            } => show_dashboard(&config, from, to, types, cities).await,
            Commands::Export {
                output,
                skip_geocode,
            } => export(&config, &output, skip_geocode).await,
        }
    };

    tokio::select! {
        result = work => result,
        _ = shutdown_signal() => {
            anyhow::bail!("Interrupted before the run completed")
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration: {}\n\n\
             Make sure:\n\
             1. {} exists\n\
             2. All required environment variables are set (check .env.example)\n\
             3. Create a .env file if needed",
            e,
            path.display()
        )
    })
}

async fn show_dashboard(
    config: &Config,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    types: Vec<String>,
    cities: Vec<String>,
) -> anyhow::Result<()> {
    let client = build_client(config.http.timeout_seconds)?;
    let google_token = if AnyWarehouse::needs_google_token(&config.warehouse) {
        Some(refresh_access_token(&client, &config.google()?.credentials()).await?)
    } else {
        None
    };
    let warehouse =
        AnyWarehouse::from_config(&config.warehouse, &client, google_token.as_deref()).await?;

    let domains = warehouse.domains().await?;
    let today = chrono::Local::now().date_naive();
    let start = from.or(domains.min_date).unwrap_or(today);
    let end = to.or(domains.max_date).unwrap_or(today);

    info!(
        "Dashboard over {} ({} types, {} cities available)",
        warehouse.describe(),
        domains.sports.len(),
        domains.cities.len()
    );

    let filter = DashboardFilter::new(start, end)?
        .with_types(types)
        .with_cities(cities);
    let view = dashboard::load_view(&warehouse, filter).await?;
    print!("{}", dashboard::render_choices(&domains));
    println!();
    print!("{}", view.render());
    Ok(())
}

async fn export(config: &Config, output: &Path, skip_geocode: bool) -> anyhow::Result<()> {
    let rows = Pipeline::extract(config, skip_geocode).await?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(output)
        .map_err(|e| anyhow::anyhow!("Cannot create {}: {}", output.display(), e))?;
    write_csv(&rows, std::io::BufWriter::new(file))?;

    info!("Exported {} activities to {}", rows.len(), output.display());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, aborting run");
        }
        _ = terminate => {
            info!("Received SIGTERM, aborting run");
        }
    }
}
