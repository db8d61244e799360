mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use pushline_cluster::{build_adapter, drain_local_sockets, ClusterBus};
use pushline_core::{
    bootstrap::{generate_node_id, load_config},
    logging, MetricsSink, NoopMetrics, PrometheusMetrics,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;

    let node_id = config
        .server
        .node_id
        .clone()
        .unwrap_or_else(generate_node_id);
    info!(%node_id, driver = %config.adapter.driver, "Pushline node starting...");

    // 3. Metrics
    let metrics: Arc<dyn MetricsSink> = match PrometheusMetrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            warn!(error = %e, "Failed to register Prometheus metrics, recording nothing");
            Arc::new(NoopMetrics)
        }
    };

    // 4. Adapter. A transport that cannot connect aborts startup.
    let adapter = build_adapter(&config.adapter, &node_id, metrics, &ClusterBus::process_group())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize {} adapter: {e}", config.adapter.driver))?;
    info!(%node_id, "Adapter ready, waiting for connections");

    // 5. Run until asked to stop
    shutdown::shutdown_signal().await;

    info!("Draining local sockets...");
    let closed = drain_local_sockets(adapter.as_ref()).await;
    if closed > 0 {
        tokio::time::sleep(Duration::from_millis(config.server.shutdown_grace_ms)).await;
    }

    if let Err(e) = adapter.disconnect().await {
        warn!(error = %e, "Adapter did not disconnect cleanly");
    }
    info!(%node_id, "Pushline node stopped");
    Ok(())
}
