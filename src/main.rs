use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use mentorlink::gateway::RealtimeGateway;
use mentorlink::principal::PrincipalResolver;
use mentorlink::registry::ConnectionRegistry;
use mentorlink::routes::{self, AppState};
use mentorlink::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        // It's not fatal if .env doesn't exist, but good to know
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Mentorlink service starting...");

    // Database path: MENTORLINK_DB, or ~/.mentorlink/mentorlink.db
    let db_path = match std::env::var("MENTORLINK_DB") {
        Ok(path) => std::path::PathBuf::from(path),
        Err(_) => {
            let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            std::path::Path::new(&home_dir)
                .join(".mentorlink")
                .join("mentorlink.db")
        }
    };

    info!("Initializing store at {}", db_path.display());
    let store = Store::new(&db_path).await?;
    store.init().await?;

    let secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
    let resolver = PrincipalResolver::new(store.clone(), &secret);

    // The registry lives for the whole process; the gateway is its only
    // writer.
    let registry = ConnectionRegistry::new();
    let gateway = RealtimeGateway::new(registry, store.clone(), resolver.clone());

    let state = Arc::new(AppState {
        store,
        resolver,
        gateway,
    });
    let app = routes::router(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5001);
    info!("Starting conversation API on port {}", port);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                info!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}
