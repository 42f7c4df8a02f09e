//! HTTP control surface (axum).
//!
//! Pairing codes, health and VCF endpoints over the shared bot services.

pub mod handlers;
pub mod router;
pub mod state;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

pub use router::build_router;
pub use state::AppState;

/// Serve until `shutdown` is cancelled.
pub async fn serve(state: AppState, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    tracing::info!("[HTTP] Listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server failed")?;
    tracing::info!("[HTTP] Server stopped");
    Ok(())
}
