//! pipe-cache server binary.

use pipe_cache::config::Config;
use pipe_cache::server::Server;
use pipe_cache::{logging, transport};
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    logging::init(&config.log_level);

    info!(
        pid = std::process::id(),
        name = %config.name,
        path = %transport::endpoint_path(&config.name).display(),
        workers = ?config.workers,
        max_connections = ?config.max_connections,
        idle_timeout = ?config.idle_timeout,
        "Starting pipe-cache server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers.filter(|&n| n > 0) {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(async {
        let server = Server::new(config);
        info!(items = server.cache().len(), "Current cache state");
        server.run().await
    })?;

    Ok(())
}
