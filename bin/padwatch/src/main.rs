//! padwatch: launchpad event ingestion service.
//!
//! Flow:
//! 1. Load settings, connect to the chain RPC and the snapshot store
//! 2. Restore cached events and watch the factory for new token/presale pairs
//! 3. Follow every discovered pair over push and/or poll transports
//! 4. Serve the cache, the pair listing and live events over HTTP

mod api;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use eyre::Result;
use padwatch_core::{Settings, telemetry};
use padwatch_ingest::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let settings = Settings::from_env()?;

    tracing::info!(
        rpc = %settings.rpc_url,
        factory = %settings.factory_address,
        mode = ?settings.transport_mode,
        "Starting padwatch"
    );

    let port = settings.api_port;
    let pipeline = Arc::new(Pipeline::connect(settings).await?);
    pipeline.start().await?;

    pipeline.discovery.on_event(|event| {
        tracing::debug!(
            id = %event.id,
            category = %event.category,
            title = %event.display.title,
            "New event"
        );
        Ok(())
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    let server = axum::serve(listener, api::router(pipeline.clone())).into_future();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tokio::select! {
        _ = &mut shutdown => {
            tracing::info!("Shutting down gracefully…");
        }
        result = server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "API server stopped");
            }
        }
    }

    pipeline.shutdown().await?;
    tracing::info!("padwatch stopped.");
    Ok(())
}
