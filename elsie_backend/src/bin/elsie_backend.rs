use anyhow::{Context, Result};
use elsie_backend::config::EngineConfig;
use elsie_backend::runtime::BackendRuntime;
use elsie_backend::server::serve_backend;
use flume::unbounded;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,elsie_backend=debug")),
        )
        .init();

    let config = EngineConfig::load();
    let (event_tx, event_rx) = unbounded();
    let runtime = BackendRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Starting scene engine service (set ELSIE_BACKEND_TOKEN + optional ELSIE_BACKEND_BIND; auth mode via ELSIE_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime, event_rx))
}
