//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One Axum router carries the websocket upgrade endpoint and the small
//! read-only REST surface. Everything stateful flows through the
//! websocket; REST exists for lobby listings and poll-style reads.

pub mod rooms;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/rooms", get(rooms::list_rooms))
        .route("/api/rooms/{id}", get(rooms::get_room))
        .route("/api/rooms/{id}/session", get(rooms::get_session))
        .route("/api/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
