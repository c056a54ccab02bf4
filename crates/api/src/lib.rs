pub mod auth;
pub mod messages;
pub mod routes;
pub mod state;
pub mod transport;
pub mod ws;

pub use state::AppState;
pub use transport::WsTransport;

use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the Axum application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/ws", get(ws::public_ws))
        .route("/ws/private", get(ws::private_ws))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway server.
pub async fn start_server(state: Arc<AppState>, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("gateway listening on {}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
