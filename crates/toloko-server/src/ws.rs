//! Socket upgrade handshake.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::debug;

use crate::api::AppState;
use crate::error::ServerError;
use crate::session;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// `GET /ws?token=<jwt>`
///
/// A missing or invalid token is answered with `401` and no upgrade. On
/// success the socket is bound to the token's user for its whole life.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.token.filter(|t| !t.is_empty()) else {
        debug!("upgrade without token");
        return ServerError::Unauthorized("Missing token".to_string()).into_response();
    };

    let claims = match state.verifier.verify(&token) {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };

    let user = claims.user_id;
    let limits = state.config.session.clone();
    let registry = state.registry.clone();
    let delivery = state.delivery.clone();

    ws.max_message_size(limits.max_frame_size)
        .max_frame_size(limits.max_frame_size)
        .on_upgrade(move |socket| session::run_session(socket, user, registry, delivery, limits))
}
