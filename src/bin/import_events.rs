use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use trendy_sync::importer::{import_events, read_records};
use trendy_sync::{BackendClient, LocalStore, SyncConfig, SyncEngine, TracingNotifier};

#[derive(Parser)]
#[command(name = "import_events")]
#[command(about = "Import events from a JSON export into the local Trendy store")]
struct Args {
    /// JSON file holding an array of events
    #[arg(short, long)]
    file: String,

    /// Local database path (or set TRENDY_DB_PATH env var)
    #[arg(long)]
    db_path: Option<String>,

    /// Sync with the backend once the import is written locally
    #[arg(short, long, default_value = "false")]
    sync: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(format!("trendy_sync={}", args.log_level))
        .init();

    if !Path::new(&args.file).exists() {
        error!("Import file does not exist: {}", args.file);
        std::process::exit(1);
    }

    let mut config = SyncConfig::from_env()?;
    config.sync_on_enqueue = false;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path.into();
    }

    let records = read_records(&args.file)?;
    info!("Importing {} records from {}", records.len(), args.file);

    let store = Arc::new(LocalStore::open(&config.db_path)?);
    let backend = Arc::new(BackendClient::from_env()?);
    let engine = SyncEngine::new(backend, store, config, Arc::new(TracingNotifier))?;

    let report = import_events(&engine, records)?;
    report.print_summary();

    if args.sync {
        match engine.manual_sync().await {
            Ok(Some(summary)) => info!(
                "Sync finished: {} queued operations sent, {} events uploaded",
                summary.drain.succeeded, summary.upload.events_created
            ),
            Ok(None) => info!("Sync skipped"),
            Err(e) => {
                error!("Sync failed: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    if report.failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
