use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};
use trendy_sync::models::{EntityKind, EventTypeLocal};
use trendy_sync::{BackendClient, LocalStore, SyncConfig, SyncEngine, TracingNotifier};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, rename_all = "snake_case")]
struct Args {
    /// Command to execute: sync, drain, status, list_event_types, list_events, list_geofences, list_queue, create_event_type, delete_event_type
    #[arg(short, long)]
    command: String,

    /// Local database path (or set TRENDY_DB_PATH env var)
    #[arg(long, name = "db_path")]
    db_path: Option<String>,

    /// Event type name (for create_event_type)
    #[arg(long)]
    name: Option<String>,

    /// Event type color (for create_event_type)
    #[arg(long, default_value = "#007AFF")]
    color: String,

    /// Event type icon (for create_event_type)
    #[arg(long, default_value = "circle.fill")]
    icon: String,

    /// Local id (for delete_event_type)
    #[arg(long)]
    id: Option<String>,

    /// Sync right after a create or delete
    #[arg(long, default_value = "false")]
    sync: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

// example usage:
// TRENDY_API_URL=http://localhost:8080 TRENDY_API_TOKEN=... ./target/release/trendy_sync_cli --command sync
// ./target/release/trendy_sync_cli --command status
// ./target/release/trendy_sync_cli --command create_event_type --name Coffee --color '#6F4E37' --icon cup.and.saucer --sync
// ./target/release/trendy_sync_cli --command delete_event_type --id 3f2b9c1e-5d0a-4a55-8a3e-2f0b1c9d7e44

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(format!("trendy_sync={}", args.log_level))
        .init();

    let mut config = SyncConfig::from_env()?;
    config.sync_on_enqueue = false;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path.into();
    }

    let store = Arc::new(LocalStore::open(&config.db_path)?);
    let backend = Arc::new(BackendClient::from_env()?);
    let engine = SyncEngine::new(backend, store, config, Arc::new(TracingNotifier))?;

    match args.command.as_str() {
        "sync" => run_sync(&engine).await,
        "drain" => match engine.drain_queue().await? {
            Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            None => info!("Drain skipped"),
        },
        "status" => {
            let status = json!({
                "state": format!("{:?}", engine.state()),
                "queued_operations": engine.queue().len()?,
                "event_types": engine.store().event_types()?.len(),
                "events": engine.store().events()?.len(),
                "geofences": engine.store().geofences()?.len(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        "list_event_types" => {
            let mut rows = Vec::new();
            for event_type in engine.store().event_types()? {
                let backend_id = engine
                    .backend_id(EntityKind::EventType, &event_type.id_local)
                    .await?;
                rows.push(json!({
                    "id_local": event_type.id_local,
                    "backend_id": backend_id,
                    "name": event_type.name,
                    "color": event_type.color,
                    "icon": event_type.icon,
                }));
            }
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        "list_events" => {
            println!("{}", serde_json::to_string_pretty(&engine.store().events()?)?);
        }
        "list_geofences" => {
            println!(
                "{}",
                serde_json::to_string_pretty(&engine.store().geofences()?)?
            );
        }
        "list_queue" => {
            println!("{}", serde_json::to_string_pretty(&engine.queue().pending()?)?);
        }
        "create_event_type" => {
            let Some(name) = args.name else {
                error!("--name is required for create_event_type");
                std::process::exit(1);
            };
            let event_type = EventTypeLocal::new(name, args.color, args.icon);
            let queued = engine.save_event_type(event_type.clone())?;
            info!(
                "Created event type {} ({}), queued as #{}",
                event_type.name, event_type.id_local, queued.sequence
            );
            if args.sync {
                run_sync(&engine).await;
            }
        }
        "delete_event_type" => {
            let Some(id) = args.id else {
                error!("--id is required for delete_event_type");
                std::process::exit(1);
            };
            if !engine.delete_event_type(&id)? {
                error!("No local event type with id {}", id);
                std::process::exit(1);
            }
            info!("Deleted event type {}", id);
            if args.sync {
                run_sync(&engine).await;
            }
        }
        other => {
            error!("Unknown command: {}", other);
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn run_sync(engine: &SyncEngine) {
    match engine.manual_sync().await {
        Ok(Some(summary)) => match serde_json::to_string_pretty(&summary) {
            Ok(rendered) => println!("{}", rendered),
            Err(e) => error!("Failed to render sync summary: {}", e),
        },
        Ok(None) => info!("Sync skipped"),
        Err(e) => {
            error!("Sync failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
