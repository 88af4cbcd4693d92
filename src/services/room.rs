//! Room service — lifecycle, membership, and room-group broadcast.
//!
//! DESIGN
//! ======
//! Rooms live only in memory. Every mutation locks the target room's
//! mutex, applies the change, and emits the resulting events to the
//! room's broadcast group before the lock is released — peers observe
//! changes in exactly the order they were applied. The registry map
//! itself is never held across a room lock acquisition inside this
//! module (handles are cloned out first), which keeps rooms independent.
//!
//! ERROR HANDLING
//! ==============
//! Operations return typed errors that the gateway converts into error
//! frames for the originating connection only. `leave_room` is
//! deliberately infallible and idempotent: disconnect cleanup must never
//! fail.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::info;
use uuid::Uuid;

use crate::backend::UserProfile;
use crate::frame::{Data, Frame, now_ms};
use crate::services::{archive, quiz};
use crate::state::{
    AppState, Participant, Role, Room, RoomSettings, RoomState, RoomStatus, SessionStatus, Visibility,
};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("{0}")]
    Validation(String),
    #[error("room not found: {0}")]
    NotFound(Uuid),
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("room is full: capacity {capacity}")]
    Capacity { capacity: usize },
    #[error("{0}")]
    Conflict(String),
}

impl crate::frame::ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "E_VALIDATION",
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::Authorization(_) => "E_AUTHORIZATION",
            Self::Capacity { .. } => "E_CAPACITY",
            Self::Conflict(_) => "E_CONFLICT",
        }
    }
}

/// Room creation payload, validated at the gateway boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRoomConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_visibility")]
    pub visibility: Visibility,
    #[serde(default)]
    pub access_code: Option<String>,
    #[serde(default)]
    pub settings: RoomSettings,
}

fn default_capacity() -> usize {
    8
}

fn default_visibility() -> Visibility {
    Visibility::Public
}

/// Client-safe view of a room. Never carries the access code.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub host_user_id: Uuid,
    pub category: Option<String>,
    pub capacity: usize,
    pub visibility: Visibility,
    pub requires_access_code: bool,
    pub settings: RoomSettings,
    pub status: RoomStatus,
    pub active_participants: usize,
    pub participants: Vec<Participant>,
    pub created_ts: i64,
    pub started_ts: Option<i64>,
}

#[must_use]
pub fn summarize(room: &Room) -> RoomSummary {
    RoomSummary {
        id: room.id,
        name: room.name.clone(),
        description: room.description.clone(),
        host_user_id: room.host_user_id,
        category: room.category.clone(),
        capacity: room.capacity,
        visibility: room.visibility,
        requires_access_code: room.access_code.is_some(),
        settings: room.settings.clone(),
        status: room.status,
        active_participants: room.active_count(),
        participants: room.participants.clone(),
        created_ts: room.created_ts,
        started_ts: room.started_ts,
    }
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Send a frame to every client in the room, optionally excluding one.
/// Callers hold the room lock, so fan-out order matches mutation order.
pub fn broadcast(room_state: &RoomState, frame: &Frame, exclude: Option<Uuid>) {
    for (client_id, tx) in &room_state.clients {
        if exclude == Some(*client_id) {
            continue;
        }
        // Best-effort: if a client's channel is full, skip it.
        let _ = tx.try_send(frame.clone());
    }
}

/// Build a server-pushed room event frame.
pub(crate) fn event(syscall: &str, room_id: Uuid, data: Data) -> Frame {
    Frame::request(syscall, data).with_room_id(room_id)
}

fn broadcast_activity(room_state: &RoomState) {
    let mut data = Data::new();
    data.insert("active_participants".into(), serde_json::json!(room_state.room.active_count()));
    data.insert("status".into(), serde_json::json!(room_state.room.status));
    let frame = event("room:activity", room_state.room.id, data);
    broadcast(room_state, &frame, None);
}

// =============================================================================
// CREATE
// =============================================================================

/// Create a room with the requesting user as host and first participant,
/// and subscribe the creating connection to the room's broadcast group.
///
/// # Errors
///
/// Returns `Validation` if capacity or question count is below 1.
pub async fn create_room(
    state: &AppState,
    host_user_id: Uuid,
    profile: &UserProfile,
    config: CreateRoomConfig,
    client_id: Uuid,
    tx: mpsc::Sender<Frame>,
) -> Result<RoomSummary, RoomError> {
    if config.capacity < 1 {
        return Err(RoomError::Validation("capacity must be at least 1".into()));
    }
    if config.settings.question_count < 1 {
        return Err(RoomError::Validation("question count must be at least 1".into()));
    }

    let room = Room {
        id: Uuid::new_v4(),
        name: config.name,
        description: config.description,
        host_user_id,
        category: config.category,
        capacity: config.capacity,
        visibility: config.visibility,
        access_code: config.access_code,
        settings: config.settings,
        participants: Vec::new(),
        status: RoomStatus::Open,
        created_ts: now_ms(),
        started_ts: None,
    };
    let room_id = room.id;

    let mut room_state = RoomState::new(room);
    let host = Participant::new(
        host_user_id,
        profile.display_name.clone(),
        profile.branch.clone(),
        Role::Host,
        room_state.next_join_seq,
    );
    room_state.next_join_seq += 1;
    room_state.room.participants.push(host);
    room_state.clients.insert(client_id, tx);
    room_state.client_users.insert(client_id, host_user_id);
    let summary = summarize(&room_state.room);

    let mut rooms = state.rooms.write().await;
    rooms.insert(room_id, Arc::new(Mutex::new(room_state)));

    info!(%room_id, %host_user_id, "room created");
    Ok(summary)
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

/// Join a room, reactivating a prior membership when one exists.
/// Subscribes the connection and notifies peers. The second element of
/// the result carries the in-flight session so a late joiner can render
/// current quiz state.
///
/// # Errors
///
/// Returns `NotFound` for an unknown or closed room, `Authorization` on
/// an access-code mismatch, and `Capacity` when the room is full.
pub async fn join_room(
    state: &AppState,
    room_id: Uuid,
    user_id: Uuid,
    profile: &UserProfile,
    access_code: Option<&str>,
    client_id: Uuid,
    tx: mpsc::Sender<Frame>,
) -> Result<(RoomSummary, Option<quiz::SessionSummary>), RoomError> {
    let handle = state
        .room_handle(room_id)
        .await
        .ok_or(RoomError::NotFound(room_id))?;
    let mut room_state = handle.lock().await;

    if room_state.room.status == RoomStatus::Closed {
        return Err(RoomError::NotFound(room_id));
    }
    if room_state.room.visibility == Visibility::Private
        && room_state.room.access_code.as_deref() != access_code
    {
        return Err(RoomError::Authorization("access code mismatch".into()));
    }

    let already_active = room_state
        .room
        .participant(user_id)
        .is_some_and(|p| p.active);
    if !already_active && room_state.room.active_count() == room_state.room.capacity {
        return Err(RoomError::Capacity { capacity: room_state.room.capacity });
    }

    let existing = room_state
        .room
        .participants
        .iter()
        .position(|p| p.user_id == user_id);
    let rejoined = match existing {
        Some(idx) => {
            // Reactivate the prior membership record; stats survive a rejoin.
            room_state.room.participants[idx].active = true;
            true
        }
        None => {
            let join_seq = room_state.next_join_seq;
            room_state.next_join_seq += 1;
            let participant = Participant::new(
                user_id,
                profile.display_name.clone(),
                profile.branch.clone(),
                Role::Member,
                join_seq,
            );
            room_state.room.participants.push(participant);
            false
        }
    };

    room_state.clients.insert(client_id, tx);
    room_state.client_users.insert(client_id, user_id);

    let joined = room_state
        .room
        .participant(user_id)
        .expect("participant must exist after join")
        .clone();
    let mut data = Data::new();
    data.insert("participant".into(), serde_json::to_value(&joined).unwrap_or_default());
    data.insert("rejoined".into(), serde_json::json!(rejoined));
    let frame = event("room:participant-joined", room_id, data);
    broadcast(&room_state, &frame, Some(client_id));
    broadcast_activity(&room_state);

    info!(%room_id, %user_id, %client_id, active = room_state.room.active_count(), "participant joined room");
    let session = room_state.session.as_ref().map(quiz::summarize_session);
    Ok((summarize(&room_state.room), session))
}

/// Leave a room. Marks the participant inactive, transfers host if
/// needed, re-runs the current question's completion check, and closes
/// the room when nobody active remains. Idempotent: leaving a room you
/// are not active in is a no-op.
pub async fn leave_room(state: &AppState, room_id: Uuid, user_id: Uuid, client_id: Uuid) {
    let Some(handle) = state.room_handle(room_id).await else {
        return;
    };
    let mut room_state = handle.lock().await;

    room_state.clients.remove(&client_id);
    room_state.client_users.remove(&client_id);

    let still_connected = room_state.client_users.values().any(|uid| *uid == user_id);
    let was_active = room_state
        .room
        .participant(user_id)
        .is_some_and(|p| p.active);
    if !was_active || still_connected {
        return;
    }

    let was_host = room_state
        .room
        .participant(user_id)
        .is_some_and(|p| p.role == Role::Host);
    if let Some(participant) = room_state.room.participant_mut(user_id) {
        participant.active = false;
        participant.ready = false;
        if was_host {
            participant.role = Role::Member;
        }
    }

    let mut data = Data::new();
    data.insert("user_id".into(), serde_json::json!(user_id));
    let frame = event("room:participant-left", room_id, data);
    broadcast(&room_state, &frame, None);

    if was_host {
        promote_successor(&mut room_state);
    }
    broadcast_activity(&room_state);
    info!(%room_id, %user_id, active = room_state.room.active_count(), "participant left room");

    if room_state.room.active_count() == 0 {
        // Everyone is gone: close and release the room.
        close_room_locked(state, &mut room_state);
        drop(room_state);
        remove_from_registry(state, room_id).await;
        return;
    }

    // A departed participant must not stall the current question.
    quiz::complete_question_if_ready(state, &mut room_state);
}

/// Promote the active participant with the earliest join order to host.
fn promote_successor(room_state: &mut RoomState) {
    let successor = room_state
        .room
        .participants
        .iter()
        .filter(|p| p.active)
        .min_by_key(|p| p.join_seq)
        .map(|p| p.user_id);
    let Some(successor_id) = successor else {
        return;
    };

    let room_id = room_state.room.id;
    room_state.room.host_user_id = successor_id;
    let participant = room_state
        .room
        .participant_mut(successor_id)
        .expect("successor must be a participant");
    participant.role = Role::Host;

    let mut data = Data::new();
    data.insert("host_user_id".into(), serde_json::json!(successor_id));
    let frame = event("room:host-changed", room_id, data);
    broadcast(room_state, &frame, None);
    info!(%room_id, host = %successor_id, "host transferred");
}

// =============================================================================
// CLOSE
// =============================================================================

/// Close a room on behalf of a user. Host-only.
///
/// # Errors
///
/// Returns `NotFound` for an unknown room and `Authorization` when the
/// requester is not the current host.
pub async fn close_room_as(state: &AppState, room_id: Uuid, user_id: Uuid) -> Result<(), RoomError> {
    {
        let handle = state
            .room_handle(room_id)
            .await
            .ok_or(RoomError::NotFound(room_id))?;
        let room_state = handle.lock().await;
        if room_state.room.host_user_id != user_id {
            return Err(RoomError::Authorization("only the host can close the room".into()));
        }
    }
    close_room(state, room_id).await;
    Ok(())
}

/// Close a room explicitly. Abandons any in-progress session and removes
/// the room from the registry. Irreversible; closing an unknown room is a
/// no-op.
pub async fn close_room(state: &AppState, room_id: Uuid) {
    let Some(handle) = state.room_handle(room_id).await else {
        return;
    };
    {
        let mut room_state = handle.lock().await;
        close_room_locked(state, &mut room_state);
    }
    remove_from_registry(state, room_id).await;
}

/// Transition the room to Closed under its lock: abandon the session,
/// archive it, and notify whoever is still connected.
fn close_room_locked(state: &AppState, room_state: &mut RoomState) {
    if room_state.room.status == RoomStatus::Closed {
        return;
    }
    room_state.room.status = RoomStatus::Closed;

    if let Some(session) = room_state.session.as_mut() {
        if session.status == SessionStatus::InProgress {
            session.status = SessionStatus::Completed;
            let snapshot = archive::snapshot_of(&room_state.room, session, true);
            archive::persist_fire_and_forget(state, snapshot);
        }
    }

    broadcast_activity(room_state);
    info!(room_id = %room_state.room.id, "room closed");
}

async fn remove_from_registry(state: &AppState, room_id: Uuid) {
    let mut rooms = state.rooms.write().await;
    rooms.remove(&room_id);
}

// =============================================================================
// READINESS / CHAT
// =============================================================================

/// Toggle a participant's readiness and notify the room. Emits
/// `room:all-ready` when the last active participant readies up.
///
/// # Errors
///
/// Returns `NotFound` for an unknown room and `Conflict` when the user
/// is not an active participant.
pub async fn set_ready(state: &AppState, room_id: Uuid, user_id: Uuid, ready: bool) -> Result<(), RoomError> {
    let handle = state
        .room_handle(room_id)
        .await
        .ok_or(RoomError::NotFound(room_id))?;
    let mut room_state = handle.lock().await;

    let participant = room_state
        .room
        .participant_mut(user_id)
        .filter(|p| p.active)
        .ok_or_else(|| RoomError::Conflict("not an active participant".into()))?;
    participant.ready = ready;

    let mut data = Data::new();
    data.insert("user_id".into(), serde_json::json!(user_id));
    data.insert("ready".into(), serde_json::json!(ready));
    let frame = event("room:ready-changed", room_id, data);
    broadcast(&room_state, &frame, None);

    let all_ready = room_state
        .room
        .participants
        .iter()
        .filter(|p| p.active)
        .all(|p| p.ready);
    if ready && all_ready {
        let frame = event("room:all-ready", room_id, Data::new());
        broadcast(&room_state, &frame, None);
    }
    Ok(())
}

/// Relay a chat message to the room with the sender's identity and a
/// server-assigned timestamp. Messages are not persisted here.
///
/// # Errors
///
/// Returns `NotFound` for an unknown room and `Conflict` when the sender
/// is not an active participant.
pub async fn send_chat(state: &AppState, room_id: Uuid, user_id: Uuid, text: &str) -> Result<(), RoomError> {
    let handle = state
        .room_handle(room_id)
        .await
        .ok_or(RoomError::NotFound(room_id))?;
    let room_state = handle.lock().await;

    let sender = room_state
        .room
        .participant(user_id)
        .filter(|p| p.active)
        .ok_or_else(|| RoomError::Conflict("not an active participant".into()))?;

    let mut data = Data::new();
    data.insert("user_id".into(), serde_json::json!(user_id));
    data.insert("display_name".into(), serde_json::json!(sender.display_name));
    data.insert("text".into(), serde_json::json!(text));
    data.insert("ts".into(), serde_json::json!(now_ms()));
    let frame = event("chat:message", room_id, data);
    broadcast(&room_state, &frame, None);
    Ok(())
}

// =============================================================================
// READS
// =============================================================================

/// List open public rooms, most active first, truncated to `limit`.
/// `branch` matches the current host's branch affiliation; `category`
/// matches the room's topic filter. Pure read.
pub async fn list_public_rooms(
    state: &AppState,
    branch: Option<&str>,
    category: Option<&str>,
    limit: usize,
) -> Vec<RoomSummary> {
    let handles: Vec<_> = {
        let rooms = state.rooms.read().await;
        rooms.values().cloned().collect()
    };

    let mut summaries = Vec::new();
    for handle in handles {
        let room_state = handle.lock().await;
        let room = &room_state.room;
        if room.status != RoomStatus::Open || room.visibility != Visibility::Public {
            continue;
        }
        if let Some(branch) = branch {
            let host_branch = room
                .participant(room.host_user_id)
                .map(|p| p.branch.as_str());
            if host_branch != Some(branch) {
                continue;
            }
        }
        if let Some(category) = category {
            if room.category.as_deref() != Some(category) {
                continue;
            }
        }
        summaries.push(summarize(room));
    }

    summaries.sort_by(|a, b| b.active_participants.cmp(&a.active_participants));
    summaries.truncate(limit);
    summaries
}

/// Fetch one room. Pure read; `None` when the room is unknown.
pub async fn get_room(state: &AppState, room_id: Uuid) -> Option<RoomSummary> {
    let handle = state.room_handle(room_id).await?;
    let room_state = handle.lock().await;
    Some(summarize(&room_state.room))
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
