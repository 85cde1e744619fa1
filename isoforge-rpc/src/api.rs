use crate::handlers::build_handler;

use axum::routing::{get, post};
use axum::Router;
use isoforge_service::JobRegistry;
use std::io;
use std::net::SocketAddr;

/// HTTP front end over a [`JobRegistry`]
pub struct RpcServer {
    registry: JobRegistry,
}

impl RpcServer {
    pub fn new(registry: JobRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Routes:
    /// - `GET  /health`
    /// - `POST /api/v1/iso/generate`
    /// - `GET  /api/v1/build/status/{id}`
    /// - `GET  /api/v1/build/logs/{id}`
    /// - `GET  /api/v1/build/download/{id}`
    /// - `GET  /api/v1/builds`
    pub fn router(&self) -> Router {
        let api = Router::new()
            .route("/iso/generate", post(build_handler::generate))
            .route("/build/status/{id}", get(build_handler::status))
            .route("/build/logs/{id}", get(build_handler::logs))
            .route("/build/download/{id}", get(build_handler::download))
            .route("/builds", get(build_handler::builds));

        Router::new()
            .route("/health", get(build_handler::health))
            .nest("/api/v1", api)
            .with_state(self.registry.clone())
    }

    /// Serve until Ctrl-C
    pub async fn serve(&self, addr: SocketAddr) -> io::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "HTTP API listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("HTTP API stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
