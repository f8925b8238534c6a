use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tsq_common::{CoordinatorConfig, PoolStatistics, QueryStatistics};
use tsq_coordinator::{
    GrpcTaskClientFactory, GrpcTaskServerFactory, IntermediateTaskProcessor, Pool, TaskHandler,
    TaskManager,
};
use tsq_protocol::TaskServiceServer;

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64_or_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize_or_default(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let bind = env_or_default("TSQ_BIND", "0.0.0.0:9000");
    let addr: SocketAddr = bind.parse()?;
    let node_id = env_or_default("TSQ_NODE_ID", &bind);
    let defaults = CoordinatorConfig::default();
    let config = CoordinatorConfig {
        task_ttl_ms: env_u64_or_default("TSQ_TASK_TTL_MS", defaults.task_ttl_ms),
        query_workers: env_usize_or_default("TSQ_QUERY_WORKERS", defaults.query_workers),
        worker_idle_timeout_ms: env_u64_or_default(
            "TSQ_WORKER_IDLE_TIMEOUT_MS",
            defaults.worker_idle_timeout_ms,
        ),
    };
    // comma-separated indicator=endpoint pairs dialed at startup
    let peers = env_or_default("TSQ_PEERS", "");

    let registry = Registry::new();
    let pool = Pool::new(
        "query",
        config.query_workers,
        Duration::from_millis(config.worker_idle_timeout_ms),
        PoolStatistics::new("query", &registry),
    );

    let client_factory = Arc::new(GrpcTaskClientFactory::new(node_id.clone()));
    let server_factory = Arc::new(GrpcTaskServerFactory::new());
    let task_manager = TaskManager::new(
        node_id.clone(),
        Arc::clone(&client_factory) as _,
        Arc::clone(&server_factory) as _,
        pool,
        config.task_ttl_ms,
        QueryStatistics::new(&registry),
    );
    client_factory.set_task_receiver(Arc::new(task_manager.clone()));

    for pair in peers.split(',').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((indicator, endpoint)) => {
                if let Err(err) = client_factory.register_node(indicator, endpoint).await {
                    warn!(peer = %indicator, error = %err, "initial peer dial failed");
                }
            }
            None => warn!(peer = %pair, "malformed TSQ_PEERS entry, expected indicator=endpoint"),
        }
    }

    let processor = Arc::new(IntermediateTaskProcessor::new(
        node_id.clone(),
        task_manager.clone(),
    ));
    let handler = TaskHandler::new(server_factory, processor);

    info!(node = %node_id, bind = %bind, "tsq node started");
    Server::builder()
        .add_service(TaskServiceServer::new(handler))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    task_manager.close();
    Ok(())
}
