//! Webhook server
//!
//! Serves the validation webhook over plain HTTP until the token is
//! cancelled. TLS is terminated in front of the pod.

use crate::error::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::webhook::WebhookRouter;
use crate::controlplane::metrics::Metrics;
use crate::validation::ValidationGate;

/// Configuration of the webhook server
#[derive(Debug, Clone)]
pub struct WebhookServerConfig {
    /// Bind address
    pub addr: SocketAddr,
}

impl Default for WebhookServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8443)),
        }
    }
}

/// Run the webhook server
pub async fn run_webhook_server(
    config: WebhookServerConfig,
    gate: Arc<ValidationGate>,
    metrics: Metrics,
    token: CancellationToken,
) -> Result<()> {
    let app = WebhookRouter::new(gate, metrics).build();

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind webhook server: {}", e)))?;
    info!("Validation webhook listening on {}", config.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            token.cancelled().await;
            info!("Webhook server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("Webhook server error: {}", e)))?;

    Ok(())
}
