//! Realtime websocket route.
//!
//! # Protocol
//!
//! The client must offer the `realtime` subprotocol at the handshake; the
//! transport layer rejects anything else, so a successful upgrade implies
//! protocol compatibility. After the upgrade, text frames carry protocol
//! events both ways; audio is Ogg-Opus, base64-encoded inside events.

use std::sync::Arc;

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::events::SUBPROTOCOL;
use crate::session::run_session;
use crate::state::AppState;

pub fn create_realtime_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/realtime", get(realtime_handler))
        .layer(TraceLayer::new_for_http())
}

async fn realtime_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    info!("Realtime websocket upgrade requested");
    ws.protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| run_session(socket, state))
}
