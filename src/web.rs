//! Status surface
//!
//! A small HTTP server exposing the controller's stats document, plus a
//! websocket that pushes the same document on every mutation.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::controller::{MonitorStats, StatsHandle};
use crate::error::{Error, Result};

#[derive(Clone)]
struct AppState {
    stats: StatsHandle,
}

/// Serve until cancelled
pub async fn serve(bind: String, stats: StatsHandle, cancel: CancellationToken) -> Result<()> {
    let app = Router::new()
        .route("/api/stats", get(get_stats))
        .route("/ws", get(ws_handler))
        .with_state(AppState { stats });

    let listener = TcpListener::bind(&bind).await?;
    info!("Status server listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Io(e.to_string()))
}

async fn get_stats(State(state): State<AppState>) -> Json<MonitorStats> {
    Json(state.stats.snapshot())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut updates = state.stats.subscribe();

    // Current document first, then every mutation
    if send_stats(&mut socket, &state.stats.snapshot()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(stats) => {
                        if send_stats(&mut socket, &stats).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Stats subscriber lagged by {} updates", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                }
            }
        }
    }
}

async fn send_stats(socket: &mut WebSocket, stats: &MonitorStats) -> std::result::Result<(), axum::Error> {
    let document = serde_json::to_string(stats).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(document)).await
}
