//! Read-only room/session routes for poll-friendly clients.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::services::{quiz, room};
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Deserialize)]
pub struct ListRoomsParams {
    pub branch: Option<String>,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

/// `GET /api/rooms` — list open public rooms, most active first.
pub async fn list_rooms(
    State(state): State<AppState>,
    Query(params): Query<ListRoomsParams>,
) -> Json<Vec<room::RoomSummary>> {
    let rooms = room::list_public_rooms(
        &state,
        params.branch.as_deref(),
        params.category.as_deref(),
        params.limit.unwrap_or(DEFAULT_LIST_LIMIT),
    )
    .await;
    Json(rooms)
}

/// `GET /api/rooms/:id` — fetch one room.
pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<room::RoomSummary>, StatusCode> {
    room::get_room(&state, room_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// `GET /api/rooms/:id/session` — fetch the room's current quiz session.
pub async fn get_session(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<quiz::SessionSummary>, StatusCode> {
    quiz::get_session(&state, room_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
