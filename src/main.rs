use std::sync::Arc;

use mcp_runtime::{config::Config, demo, logging, Dispatch};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    info!(
        transport = %config.transport,
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        workers = config.worker_threads,
        "configuration loaded"
    );

    let server: Arc<dyn Dispatch> = Arc::new(demo::demo_server()?);
    mcp_runtime::serve(&config, server).await?;
    Ok(())
}
