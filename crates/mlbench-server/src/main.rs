//! mlbench: distributed benchmark run orchestration server.

use std::sync::Arc;

use mlbench_core::EngineConfig;
use mlbench_runtime::{Reconciler, ShutdownToken};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod error;
mod routes;
mod state;

use state::AppState;

fn print_usage() {
    println!("mlbench — distributed benchmark run orchestration");
    println!();
    println!("Usage: mlbench [command]");
    println!();
    println!("Commands:");
    println!("  (none)    Start the server");
    println!("  help      Show this help message");
    println!();
    println!("Configuration is read from the environment:");
    println!("  PORT, MLBENCH_DATA_DIR, MLBENCH_CLUSTER_URL, MLBENCH_MAX_BANDWIDTH_MBIT,");
    println!("  MLBENCH_RECONCILE_INTERVAL_SECS, MLBENCH_PROVISION_TIMEOUT_SECS,");
    println!("  MLBENCH_WORKER_LOST_POLLS, MLBENCH_SSH_SECRET, MLBENCH_SSH_PORT,");
    println!("  MLBENCH_MAX_ACTIVE_RUNS, MLBENCH_TEARDOWN_BACKOFF_SECS,");
    println!("  MLBENCH_TEARDOWN_BACKOFF_MAX_SECS, MLBENCH_CLUSTER_CALL_TIMEOUT_SECS");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--help" | "-h" | "help" => {
                print_usage();
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'mlbench help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    let config = EngineConfig::from_env()?;
    info!("Data directory: {}", config.data_dir.display());
    let port = config.port;

    let state = Arc::new(AppState::open(config)?);
    state.orchestrator.resume();

    let shutdown = ShutdownToken::new();
    let reconciler = Reconciler::new(state.orchestrator.clone()).spawn(shutdown.clone());

    let app = routes::build_router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("mlbench server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    shutdown.cancel();
    reconciler.await?;
    info!("mlbench server stopped");

    Ok(())
}
