use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::AppState;
use crate::ws;

/// Register a fresh session, then upgrade into the connection loop.
///
/// Registration happens before the upgrade so a directory failure is reported
/// as a plain HTTP 500 and the socket is never opened.
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let session_id = uuid::Uuid::new_v4().to_string();

    let session = match state.registry.register(&session_id).await {
        Ok(session) => session,
        Err(e) => {
            state.metrics.registration_failed();
            error!(session_id = %session_id, "Session registration failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let registry = state.registry.clone();
    let server_config = state.server_config.clone();
    let metrics = state.metrics.clone();

    ws.on_upgrade(move |socket| {
        ws::handle_connection(socket, session, registry, server_config, metrics)
    })
}
