use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use shard_query_backend::api::handlers::AppState;
use shard_query_backend::api::routes::create_router_with_state;
use shard_query_backend::config::Config;
use shard_query_backend::services::execution::{ConnectionPoolManager, ExecutionDispatcher, ExecutorRegistry};
use shard_query_backend::services::federation::{DataFusionFederationEngine, FederationSessionFactory};
use shard_query_backend::services::{KernelSettings, QueryService, RuleRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_ansi(config.logging.style != "never")
        .init();

    info!("Starting server on {}", config.server_address());

    let rules = RuleRegistry::from_config(config.load_rules()?).map_err(|e| {
        error!("Failed to load sharding rules: {}", e);
        e
    })?;

    let pools = Arc::new(ConnectionPoolManager::with_max_size(config.engine.max_concurrent_units));
    let executors = ExecutorRegistry::from_urls(&config.data_sources, &pools)
        .await
        .map_err(|e| {
            error!("Failed to register data sources: {}", e);
            e
        })?;
    let dispatcher = Arc::new(ExecutionDispatcher::new(
        executors,
        config.engine.max_concurrent_units,
        config.engine.max_connections_per_query,
        config.engine.query_timeout(),
    ));
    let federation = Arc::new(DataFusionFederationEngine::new(
        dispatcher.clone(),
        FederationSessionFactory::default(),
    ));
    let service = QueryService::new(
        Arc::new(rules),
        dispatcher,
        federation,
        KernelSettings::from(&config.engine),
    );

    // Create router with state
    let app: Router = create_router_with_state(AppState {
        service: Arc::new(service),
        pools,
    });

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
