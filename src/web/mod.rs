//! Web server module.

mod handlers;

use crate::config::Config;
use crate::db::Store;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub scheduler: Arc<Scheduler>,
}

/// Web server for powertrail.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: Config, store: Store, scheduler: Arc<Scheduler>) -> Self {
        Self {
            state: AppState {
                config,
                store,
                scheduler,
            },
        }
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = routes(self.state.clone());

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("Web server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Build the router with all routes.
fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/api/samples", post(handlers::handle_ingest))
        .route("/api/devices/{id}", put(handlers::handle_put_device))
        .route("/api/tariffs", post(handlers::handle_create_tariff))
        .route("/api/chart", get(handlers::handle_chart))
        .route("/api/live", get(handlers::handle_live))
        .route("/api/pipeline/run", post(handlers::handle_run_pipeline))
        .route("/api/status", get(handlers::handle_status))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}
