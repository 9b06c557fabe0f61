//! HTTP and WebSocket server

pub mod multiplexer;
pub mod protocol;
pub mod routes;
pub mod ws;

use anyhow::{Context, Result};
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::chat::ChatService;
pub use multiplexer::Multiplexer;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub multiplexer: Arc<Multiplexer>,
}

impl AppState {
    pub fn new(chat: Arc<ChatService>) -> Self {
        Self {
            multiplexer: Multiplexer::new(chat.clone()),
            chat,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/ws", get(ws::ws_handler))
        .route("/api/sessions", get(routes::list_sessions).post(routes::create_session))
        .route("/api/chat", post(routes::post_chat))
        .route("/api/chat/{session_id}", delete(routes::delete_session))
        .route("/api/chat/{session_id}/history", get(routes::session_history))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(state: AppState, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
    info!("Shutdown signal received");
}
