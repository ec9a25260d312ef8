mod config;
mod docker;
mod logging;
mod logstore;
mod metrics;
mod queue;
mod realtime;
mod server;
mod session;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::docker::{ContainerPool, DockerClient, PoolConfig};
use crate::logstore::SessionLogStore;
use crate::queue::AdmissionQueue;
use crate::realtime::RealtimeChannel;
use crate::server::{routes::create_router, AppState};
use crate::session::SessionManager;

#[derive(Parser)]
#[command(name = "cloudbrowser")]
#[command(about = "Control plane for short-lived sandboxed browser sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and container pool (default)
    Serve {
        /// Host to bind
        #[arg(short = 'H', long, default_value = "0.0.0.0")]
        host: String,

        /// Port to bind
        #[arg(short, long, default_value = "8000", env = "PORT")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let config = Config::from_env();
    let _ = logging::init(&format!("{}/logs", config.data_dir));

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve {
        host: "0.0.0.0".to_string(),
        port: 8000,
    });

    match command {
        Commands::Serve { host, port } => serve(config, &host, port).await,
    }
}

async fn serve(config: Config, host: &str, port: u16) -> Result<()> {
    info!("Starting cloudbrowser control plane...");

    let docker = Arc::new(DockerClient::new().await?);

    let pool = Arc::new(ContainerPool::new(
        Arc::clone(&docker),
        PoolConfig::from(&config),
        config.pool_size,
    ));
    pool.init().await?;
    pool.spawn_health_loop();

    let log_store = Arc::new(SessionLogStore::open(&config.data_dir).await?);

    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&pool),
        Arc::clone(&log_store),
        config.session_duration_secs,
        config.rate_limit_per_day,
    ));
    sessions.spawn_expiry_loop();

    let queue = Arc::new(AdmissionQueue::new(
        Arc::clone(&pool),
        Arc::clone(&sessions),
    ));
    queue.spawn_worker();

    let realtime = Arc::new(RealtimeChannel::new(Arc::clone(&sessions)));
    realtime.spawn_timer_loop();

    let state = Arc::new(AppState {
        config,
        pool,
        sessions,
        queue,
        realtime,
        log_store,
    });

    ctrlc::set_handler(move || {
        info!("Shutting down cloudbrowser...");
        std::process::exit(0);
    })?;

    let app = create_router(state);

    let bind_addr = format!("{}:{}", host, port);
    info!("Binding to: {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("REST API: http://{}/api", bind_addr);
    info!("Realtime channel: ws://{}/ws", bind_addr);
    info!("Ready to accept requests...");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
