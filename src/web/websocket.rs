use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error};

use super::AppState;
use crate::remote::protocol::CommandHandler;
use crate::remote::server::dispatch_detached;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ws/", get(websocket_handler))
        .route("/ws", get(websocket_handler))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let handler: Arc<dyn CommandHandler> = Arc::new(state.manager.clone());
    let updates = state.broadcaster.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, handler, updates))
}

async fn handle_socket(
    socket: WebSocket,
    handler: Arc<dyn CommandHandler>,
    mut updates: broadcast::Receiver<Arc<str>>,
) {
    let (mut sender, mut receiver) = socket.split();

    // Send initial status
    let initial = match serde_json::to_string(&handler.status()) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialise status: {}", e);
            return;
        }
    };
    if let Err(e) = sender.send(Message::Text(initial)).await {
        debug!("Failed to send initial status: {}", e);
        return;
    }

    // Forward broadcast snapshots
    let mut send_task = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(json) => {
                    if sender.send(Message::Text(json.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("WebSocket client skipped {} snapshots", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Handle incoming commands
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => dispatch_detached(&handler, &text, "websocket"),
                Message::Close(_) => {
                    debug!("WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
        }
    }

    debug!("WebSocket connection closed");
}
