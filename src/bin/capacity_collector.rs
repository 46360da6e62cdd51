use std::env;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vsphere_capacity::collector::{run_collection, ClusterSink, PostgresSink};
use vsphere_capacity::config::CollectorConfig;
use vsphere_capacity::credentials::{seal, CredentialProvider, SealedCredentials};
use vsphere_capacity::db::lifecycle::load_lifecycle_map;
use vsphere_capacity::db::{CapacityStore, MemoryStore, PgStore};
use vsphere_capacity::inventory::{load_hardware_map, load_snapshots, HardwareMap, LifecycleMap};

const CREDENTIAL_KEY_ENV: &str = "CAPACITY_CREDENTIAL_KEY";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Persist every cluster of every snapshot, then run the decommission sweep
    Collect {
        /// Write into an in-memory store and only log row counts
        #[arg(long)]
        dry_run: bool,
    },
    /// Run only the decommission sweep
    Sweep {
        /// Days without modification before a row is decommissioned
        #[arg(long)]
        days: Option<u32>,
    },
    /// Create the reporting tables
    InitSchema,
    /// Seal a password read from stdin for the credentials section
    SealPassword {
        #[arg(long)]
        user: String,
    },
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "capacity-collector.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    // Log to stdout: human-readable format
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sea_orm=warn,sqlx::query=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

fn credential_key() -> Result<String, BoxError> {
    env::var(CREDENTIAL_KEY_ENV)
        .map_err(|_| format!("{CREDENTIAL_KEY_ENV} must be set").into())
}

fn credential_provider(config: &CollectorConfig) -> Result<Arc<dyn CredentialProvider>, BoxError> {
    let creds = SealedCredentials::new(&credential_key()?, config.credentials.clone())?;
    Ok(Arc::new(creds))
}

fn seal_password(user: &str) -> Result<(), BoxError> {
    dotenv::dotenv().ok();
    let key = credential_key()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        return Err("no password given on stdin".into());
    }
    println!("{user} = \"{}\"", seal(password, &key)?);
    Ok(())
}

async fn collect(config: &CollectorConfig, dry_run: bool) -> Result<(), BoxError> {
    let snapshots = load_snapshots(&config.snapshot_dir)?;
    let hw_map = match &config.hardware_map {
        Some(path) => load_hardware_map(path)?,
        None => HardwareMap::new(),
    };

    if dry_run {
        info!("Dry run: writing into an in-memory store.");
        let mut store = MemoryStore::new();
        let report = run_collection(
            &snapshots,
            &hw_map,
            &LifecycleMap::new(),
            &mut store,
            config.decommission_after_days,
        )
        .await?;
        for (table, rows) in store.summary() {
            info!(table, rows, "Dry run row count.");
        }
        info!(failed = report.failures.len(), "Dry run finished.");
        return Ok(());
    }

    let credentials = credential_provider(config)?;
    let lifecycle_map = match &config.lifecycle_db {
        Some(params) => match load_lifecycle_map(params, credentials.as_ref()).await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "Lifecycle database unavailable; hosts get no contract dates.");
                LifecycleMap::new()
            }
        },
        None => LifecycleMap::new(),
    };

    let mut sink = PostgresSink::new(config.capacity_db.clone(), credentials);
    let report = run_collection(
        &snapshots,
        &hw_map,
        &lifecycle_map,
        &mut sink,
        config.decommission_after_days,
    )
    .await?;
    for failure in &report.failures {
        warn!(
            source_system = %failure.source_system,
            cluster = %failure.cluster,
            "Cluster not persisted: {}",
            failure.error
        );
    }
    Ok(())
}

async fn sweep(config: &CollectorConfig, days: Option<u32>) -> Result<(), BoxError> {
    let credentials = credential_provider(config)?;
    let mut sink = PostgresSink::new(config.capacity_db.clone(), credentials);
    let days = days.unwrap_or(config.decommission_after_days);
    let report = sink.sweep(days).await?;
    info!(
        swept = report.tables_swept,
        skipped = report.tables_skipped.len(),
        decommissioned = report.rows_decommissioned,
        references_removed = report.references_removed,
        "Decommission sweep finished."
    );
    Ok(())
}

async fn init_schema(config: &CollectorConfig) -> Result<(), BoxError> {
    let credentials = credential_provider(config)?;
    let mut store = PgStore::connect(&config.capacity_db, credentials.as_ref())
        .await?;
    let applied = store.apply_schema().await;
    if let Err(e) = store.close().await {
        warn!(error = %e, "Failed to close database connection.");
    }
    Ok(applied?)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    if let Command::SealPassword { user } = &args.command {
        return seal_password(user);
    }

    let config = CollectorConfig::load(args.config.as_deref());
    let log_dir = config
        .as_ref()
        .map(|c| c.log_dir.clone())
        .unwrap_or_else(|_| "logs".to_string());
    init_logging(&log_dir);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load collector configuration: {}", e);
            return Err(e.into());
        }
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting capacity collector."
    );

    let result = match args.command {
        Command::Collect { dry_run } => collect(&config, dry_run).await,
        Command::Sweep { days } => sweep(&config, days).await,
        Command::InitSchema => init_schema(&config).await,
        Command::SealPassword { .. } => Ok(()),
    };
    if let Err(e) = &result {
        error!("Capacity collector failed: {}", e);
    }
    result
}
