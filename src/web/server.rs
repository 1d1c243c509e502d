//! HTTP server wiring the admission layer in front of the application routes.

use std::net::SocketAddr;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::layer::AdmissionLayer;
use crate::error::{GatekeeperError, Result};

/// HTTP server for the demo application.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Admission layer applied to every route
    layer: AdmissionLayer,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, layer: AdmissionLayer) -> Self {
        Self { addr, layer }
    }

    /// Build the router with every route behind the admission layer.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(hello_handler))
            .route("/health", get(health_handler))
            .layer(self.layer.clone())
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            GatekeeperError::Io(e)
        })?;

        info!(
            addr = %self.addr,
            window = ?self.layer.filter().policy().window(),
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            GatekeeperError::Io(e)
        })
    }
}

async fn hello_handler() -> &'static str {
    "Hello World!"
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
