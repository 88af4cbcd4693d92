//! WebSocket handler — the presence gateway.
//!
//! DESIGN
//! ======
//! On upgrade, the connection token is verified against the backend and
//! the user's profile is resolved (with a placeholder fallback so a
//! directory outage never blocks connecting). Each connection then runs a
//! `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Broadcast frames from room peers → forward to the client
//!
//! Handler functions validate and call into the services, returning an
//! `Outcome` for the sender-directed reply. Room-directed events (peer
//! joins, questions, leaderboards, chat) are fanned out by the services
//! themselves while the room lock is held, which preserves causal order.
//! Error frames go to the originating connection only, never the room.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `client_id`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Close (graceful or abrupt) → `leave_room` for the current room →
//!    host succession / question advancement / room closure as needed

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::UserProfile;
use crate::frame::{Data, Frame};
use crate::services::{quiz, room};
use crate::state::AppState;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions for the sender-directed reply.
/// Room-directed fan-out already happened inside the service call.
enum Outcome {
    /// Send done+data to sender only.
    Reply(Data),
    /// Send empty done to sender only.
    Done,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = params.get("token") else {
        return (StatusCode::UNAUTHORIZED, "token required").into_response();
    };

    let user_id = match state.tokens.verify(token).await {
        Ok(Some(uid)) => uid,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "ws token verification failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "token verification error").into_response();
        }
    };

    let profile = resolve_profile(&state, user_id).await;
    ws.on_upgrade(move |socket| run_ws(socket, state, user_id, profile))
}

/// Look up the user's display profile, degrading to a placeholder when
/// the directory is unreachable or has no record.
async fn resolve_profile(state: &AppState, user_id: Uuid) -> UserProfile {
    match state.directory.profile(user_id).await {
        Ok(Some(profile)) => profile,
        Ok(None) => placeholder_profile(user_id),
        Err(e) => {
            warn!(error = %e, %user_id, "profile lookup failed; using placeholder");
            placeholder_profile(user_id)
        }
    }
}

fn placeholder_profile(user_id: Uuid) -> UserProfile {
    let short = &user_id.simple().to_string()[..8];
    UserProfile { display_name: format!("Recruit-{short}"), branch: "UNKNOWN".into() }
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, user_id: Uuid, profile: UserProfile) {
    let client_id = Uuid::new_v4();

    // Per-connection channel for receiving broadcast frames from peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(256);

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("client_id", client_id.to_string())
        .with_data("user_id", user_id.to_string())
        .with_data("display_name", profile.display_name.clone());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(%client_id, %user_id, "ws: client connected");

    // At most one joined room per connection.
    let mut current_room: Option<Uuid> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(
                            &state, &mut current_room, client_id, user_id, &profile, &client_tx, &text,
                        )
                        .await;
                        for frame in replies {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    // Runs for abrupt disconnects too: the departure must reach the room
    // before this connection disappears from its broadcast group.
    if let Some(room_id) = current_room {
        room::leave_room(&state, room_id, user_id, client_id).await;
    }
    info!(%client_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the
/// sender. Split from the socket loop so tests can drive dispatch
/// without a live transport.
async fn process_inbound_text(
    state: &AppState,
    current_room: &mut Option<Uuid>,
    client_id: Uuid,
    user_id: Uuid,
    profile: &UserProfile,
    client_tx: &mpsc::Sender<Frame>,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Stamp the authenticated user_id as `from`.
    req.from = Some(user_id.to_string());
    info!(%client_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");

    let result = match req.prefix() {
        "room" => handle_room(state, current_room, client_id, user_id, profile, client_tx, &req).await,
        "quiz" => handle_quiz(state, *current_room, user_id, &req).await,
        "chat" => handle_chat(state, *current_room, user_id, &req).await,
        other => Err(req.error(format!("unknown prefix: {other}"))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// ROOM HANDLERS
// =============================================================================

async fn handle_room(
    state: &AppState,
    current_room: &mut Option<Uuid>,
    client_id: Uuid,
    user_id: Uuid,
    profile: &UserProfile,
    client_tx: &mpsc::Sender<Frame>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    match req.op() {
        "create" => {
            let config: room::CreateRoomConfig =
                match serde_json::from_value(serde_json::to_value(&req.data).unwrap_or_default()) {
                    Ok(c) => c,
                    Err(e) => return Err(req.error(format!("invalid room config: {e}"))),
                };

            // Part the previous room first; one room per connection.
            if let Some(old_room) = current_room.take() {
                room::leave_room(state, old_room, user_id, client_id).await;
            }

            match room::create_room(state, user_id, profile, config, client_id, client_tx.clone()).await {
                Ok(summary) => {
                    *current_room = Some(summary.id);
                    let mut reply = Data::new();
                    reply.insert("room".into(), serde_json::to_value(&summary).unwrap_or_default());
                    Ok(Outcome::Reply(reply))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "join" => {
            let Some(room_id) = req.room_id.or_else(|| {
                req.data
                    .get("room_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
            }) else {
                return Err(req.error("room_id required"));
            };
            let access_code = req.data.get("access_code").and_then(|v| v.as_str());

            if let Some(old_room) = current_room.take() {
                room::leave_room(state, old_room, user_id, client_id).await;
            }

            match room::join_room(state, room_id, user_id, profile, access_code, client_id, client_tx.clone()).await
            {
                Ok((summary, session)) => {
                    *current_room = Some(room_id);
                    let mut reply = Data::new();
                    reply.insert("room".into(), serde_json::to_value(&summary).unwrap_or_default());
                    if let Some(session) = session {
                        reply.insert("session".into(), serde_json::to_value(&session).unwrap_or_default());
                    }
                    Ok(Outcome::Reply(reply))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "leave" => {
            if let Some(room_id) = current_room.take() {
                room::leave_room(state, room_id, user_id, client_id).await;
            }
            Ok(Outcome::Done)
        }
        "ready" => {
            let Some(room_id) = *current_room else {
                return Err(req.error("must join a room first"));
            };
            let Some(ready) = req.data.get("ready").and_then(serde_json::Value::as_bool) else {
                return Err(req.error("ready flag required"));
            };
            match room::set_ready(state, room_id, user_id, ready).await {
                Ok(()) => Ok(Outcome::Done),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "close" => {
            let Some(room_id) = *current_room else {
                return Err(req.error("must join a room first"));
            };
            match room::close_room_as(state, room_id, user_id).await {
                Ok(()) => {
                    *current_room = None;
                    Ok(Outcome::Done)
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "list" => {
            let branch = req.data.get("branch").and_then(|v| v.as_str());
            let category = req.data.get("category").and_then(|v| v.as_str());
            let limit = req
                .data
                .get("limit")
                .and_then(serde_json::Value::as_u64)
                .map_or(50, |v| usize::try_from(v).unwrap_or(50));
            let rooms = room::list_public_rooms(state, branch, category, limit).await;
            let mut reply = Data::new();
            reply.insert("rooms".into(), serde_json::to_value(&rooms).unwrap_or_default());
            Ok(Outcome::Reply(reply))
        }
        other => Err(req.error(format!("unknown room op: {other}"))),
    }
}

// =============================================================================
// QUIZ HANDLERS
// =============================================================================

async fn handle_quiz(
    state: &AppState,
    current_room: Option<Uuid>,
    user_id: Uuid,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let Some(room_id) = current_room else {
        return Err(req.error("must join a room first"));
    };

    match req.op() {
        "start" => match quiz::start_session(state, room_id, user_id).await {
            Ok(summary) => {
                let mut reply = Data::new();
                reply.insert("session".into(), serde_json::to_value(&summary).unwrap_or_default());
                Ok(Outcome::Reply(reply))
            }
            Err(e) => Err(req.error_from(&e)),
        },
        "answer" => {
            let Some(answer) = req.data.get("answer").and_then(|v| v.as_str()) else {
                return Err(req.error("answer required"));
            };
            let latency_ms = req
                .data
                .get("latency_ms")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);

            match quiz::submit_answer(state, room_id, user_id, answer, latency_ms).await {
                Ok(verdict) => {
                    // Private to the submitter; peers only see the
                    // leaderboard update and, later, the results phase.
                    let reply = match serde_json::to_value(&verdict) {
                        Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
                        _ => Data::new(),
                    };
                    Ok(Outcome::Reply(reply))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        other => Err(req.error(format!("unknown quiz op: {other}"))),
    }
}

// =============================================================================
// CHAT HANDLER
// =============================================================================

async fn handle_chat(
    state: &AppState,
    current_room: Option<Uuid>,
    user_id: Uuid,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let Some(room_id) = current_room else {
        return Err(req.error("must join a room first"));
    };

    match req.op() {
        "send" => {
            let text = req.data.get("text").and_then(|v| v.as_str()).unwrap_or("");
            if text.is_empty() {
                return Err(req.error("text required"));
            }
            match room::send_chat(state, room_id, user_id, text).await {
                Ok(()) => Ok(Outcome::Done),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        other => Err(req.error(format!("unknown chat op: {other}"))),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == crate::frame::Status::Error {
        let code = frame.data.get("code").and_then(|v| v.as_str()).unwrap_or("-");
        let message = frame.data.get("message").and_then(|v| v.as_str()).unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
