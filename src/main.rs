use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use swarm_listener::cli::{format_dry_run, Args};
use swarm_listener::config::{load_env_file, Config};
use swarm_listener::listener::SwarmListener;
use swarm_listener::metrics::new_shared_metrics;
use swarm_listener::notify::NotifyDistributor;
use swarm_listener::server::{create_router, AppState};
use swarm_listener::source::DockerClient;

#[tokio::main]
async fn main() {
    let mut args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Options may come from the env file, so parse again once it is loaded
    if let Some(env_file) = args.env_file.clone() {
        if let Err(e) = load_env_file(&env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
        args = Args::parse();
    }

    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    if args.dry_run {
        println!("{}", format_dry_run(&config));
        return;
    }

    let client = match DockerClient::new(config.docker.clone()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to create Docker client for {}: {}", config.docker.host, e);
            process::exit(1);
        }
    };

    let metrics = new_shared_metrics();
    let distributor =
        NotifyDistributor::from_endpoints(&config.endpoints, config.notifier, metrics.clone());
    let listener = Arc::new(SwarmListener::new(
        client,
        distributor,
        config.listener.clone(),
        metrics.clone(),
    ));

    info!("Starting swarm-listener against {}", config.docker.host);
    info!("Loaded {} listener endpoint(s)", config.endpoints.len());

    let _sources = listener.start().await;

    if config.notify_on_start {
        let listener = listener.clone();
        tokio::spawn(async move { listener.notify_on_start().await });
    }

    let addr = format!("{}:{}", config.bind_addr, config.port);
    let app = create_router(AppState::new(listener, metrics));

    let tcp_listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET /v1/swarm-listener/notify-services - Resync services");
    info!("  GET /v1/swarm-listener/notify-nodes    - Resync nodes");
    info!("  GET /v1/swarm-listener/get-services    - List service parameters");
    info!("  GET /v1/swarm-listener/get-nodes       - List node parameters");
    info!("  GET /v1/swarm-listener/ping            - Liveness");
    info!("  GET /metrics                           - Error counters");

    if let Err(e) = axum::serve(tcp_listener, app).await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
