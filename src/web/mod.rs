pub mod websocket;

use crate::backup::BackupManager;
use crate::remote::StatusBroadcaster;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared state of the HTTP/WebSocket listener.
#[derive(Clone)]
pub struct AppState {
    pub manager: BackupManager,
    pub broadcaster: StatusBroadcaster,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api", crate::api::routes())
        .merge(websocket::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
