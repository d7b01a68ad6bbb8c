//! HTTP and WebSocket API
//!
//! ## Endpoints
//!
//! - `POST /api/actions` - record a qualifying action
//! - `GET /api/standings/:user_id` - points and donation count
//! - `GET /api/users/:user_id/badges` - earned badges and the next one in reach
//! - `GET /api/badges` - badge catalog
//! - `GET /api/leaderboard?limit=N` - top standings
//! - `POST /api/donations`, `GET /api/donations` - create / list available
//! - `GET|PATCH|DELETE /api/donations/:id` - read, change status, remove
//! - `GET /ws?topics=stats,badges,donations` - live change feed
//! - `GET /health`

pub mod routes;
pub mod ws;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::services::Services;

/// State shared by every handler
pub struct AppState {
    pub services: Arc<Services>,
    /// How long a handler waits on a ledger write before answering 504
    pub action_timeout: Duration,
}

impl AppState {
    pub fn new(services: Arc<Services>, action_timeout: Duration) -> Self {
        Self {
            services,
            action_timeout,
        }
    }
}

pub type SharedState = Arc<AppState>;

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/actions", post(routes::record_action))
        .route("/api/standings/:user_id", get(routes::get_standing))
        .route("/api/users/:user_id/badges", get(routes::user_badges))
        .route("/api/badges", get(routes::badge_catalog))
        .route("/api/leaderboard", get(routes::leaderboard))
        .route(
            "/api/donations",
            post(routes::create_donation).get(routes::list_donations),
        )
        .route(
            "/api/donations/:id",
            get(routes::get_donation)
                .patch(routes::update_donation)
                .delete(routes::delete_donation),
        )
        .route("/ws", get(ws::feed))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve_with_shutdown<F>(listener: TcpListener, state: SharedState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("HTTP API listening on {}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("HTTP API shut down");
    Ok(())
}

/// Serve until Ctrl+C or SIGTERM
pub async fn serve(listener: TcpListener, state: SharedState) -> std::io::Result<()> {
    serve_with_shutdown(listener, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
