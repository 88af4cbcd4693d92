use super::*;
use crate::backend::UserProfile;
use crate::frame::Status;
use crate::state::{RoomSettings, test_helpers};
use tokio::time::{Duration, timeout};

fn profile(name: &str, branch: &str) -> UserProfile {
    UserProfile { display_name: name.into(), branch: branch.into() }
}

fn config(capacity: usize) -> CreateRoomConfig {
    CreateRoomConfig {
        name: "AFQT drill".into(),
        description: None,
        category: None,
        capacity,
        visibility: Visibility::Public,
        access_code: None,
        settings: RoomSettings::default(),
    }
}

async fn recv_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("frame receive timed out")
        .expect("channel closed")
}

/// Drain frames until one with the given syscall arrives.
async fn recv_until(rx: &mut mpsc::Receiver<Frame>, syscall: &str) -> Frame {
    loop {
        let frame = recv_frame(rx).await;
        if frame.syscall == syscall {
            return frame;
        }
    }
}

async fn assert_channel_empty(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected channel to remain empty"
    );
}

/// Create a room through the service and return (room_id, host rx).
async fn host_a_room(
    state: &crate::state::AppState,
    host_id: Uuid,
    capacity: usize,
) -> (Uuid, Uuid, mpsc::Receiver<Frame>) {
    let client_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(64);
    let summary = create_room(state, host_id, &profile("Host", "ARMY"), config(capacity), client_id, tx)
        .await
        .expect("create_room should succeed");
    (summary.id, client_id, rx)
}

async fn join_as(
    state: &crate::state::AppState,
    room_id: Uuid,
    user_id: Uuid,
    name: &str,
) -> (Uuid, mpsc::Receiver<Frame>) {
    let client_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(64);
    join_room(state, room_id, user_id, &profile(name, "NAVY"), None, client_id, tx)
        .await
        .expect("join_room should succeed");
    (client_id, rx)
}

// =============================================================================
// CREATE
// =============================================================================

#[tokio::test]
async fn create_room_rejects_zero_capacity() {
    let state = test_helpers::test_app_state();
    let (tx, _rx) = mpsc::channel(8);
    let result = create_room(&state, Uuid::new_v4(), &profile("H", "ARMY"), config(0), Uuid::new_v4(), tx).await;
    assert!(matches!(result.unwrap_err(), RoomError::Validation(_)));
}

#[tokio::test]
async fn create_room_rejects_zero_question_count() {
    let state = test_helpers::test_app_state();
    let mut cfg = config(4);
    cfg.settings.question_count = 0;
    let (tx, _rx) = mpsc::channel(8);
    let result = create_room(&state, Uuid::new_v4(), &profile("H", "ARMY"), cfg, Uuid::new_v4(), tx).await;
    assert!(matches!(result.unwrap_err(), RoomError::Validation(_)));
}

#[tokio::test]
async fn create_room_seats_host_as_first_participant() {
    let state = test_helpers::test_app_state();
    let host_id = Uuid::new_v4();
    let (room_id, _client, _rx) = host_a_room(&state, host_id, 4).await;

    let summary = get_room(&state, room_id).await.expect("room should exist");
    assert_eq!(summary.status, RoomStatus::Open);
    assert_eq!(summary.active_participants, 1);
    assert_eq!(summary.host_user_id, host_id);
    assert_eq!(summary.participants[0].role, Role::Host);
}

// =============================================================================
// JOIN
// =============================================================================

#[tokio::test]
async fn join_unknown_room_not_found() {
    let state = test_helpers::test_app_state();
    let (tx, _rx) = mpsc::channel(8);
    let result = join_room(
        &state,
        Uuid::new_v4(),
        Uuid::new_v4(),
        &profile("M", "NAVY"),
        None,
        Uuid::new_v4(),
        tx,
    )
    .await;
    assert!(matches!(result.unwrap_err(), RoomError::NotFound(_)));
}

#[tokio::test]
async fn private_room_requires_matching_access_code() {
    let state = test_helpers::test_app_state();
    let host_id = Uuid::new_v4();
    let mut cfg = config(4);
    cfg.visibility = Visibility::Private;
    cfg.access_code = Some("1776".into());
    let (tx, _rx) = mpsc::channel(8);
    let summary = create_room(&state, host_id, &profile("H", "ARMY"), cfg, Uuid::new_v4(), tx)
        .await
        .unwrap();

    let (tx, _rx) = mpsc::channel(8);
    let wrong = join_room(
        &state,
        summary.id,
        Uuid::new_v4(),
        &profile("M", "NAVY"),
        Some("0000"),
        Uuid::new_v4(),
        tx,
    )
    .await;
    assert!(matches!(wrong.unwrap_err(), RoomError::Authorization(_)));

    let (tx, _rx) = mpsc::channel(8);
    let right = join_room(
        &state,
        summary.id,
        Uuid::new_v4(),
        &profile("M", "NAVY"),
        Some("1776"),
        Uuid::new_v4(),
        tx,
    )
    .await;
    assert!(right.is_ok());
}

#[tokio::test]
async fn full_room_rejects_new_joiner() {
    // Capacity 2: host + one member fill the room; a third user bounces.
    let state = test_helpers::test_app_state();
    let host_id = Uuid::new_v4();
    let (room_id, _host_client, _host_rx) = host_a_room(&state, host_id, 2).await;
    let (_b_client, _b_rx) = join_as(&state, room_id, Uuid::new_v4(), "B").await;

    let (tx, _rx) = mpsc::channel(8);
    let result = join_room(
        &state,
        room_id,
        Uuid::new_v4(),
        &profile("C", "NAVY"),
        None,
        Uuid::new_v4(),
        tx,
    )
    .await;
    assert!(matches!(result.unwrap_err(), RoomError::Capacity { capacity: 2 }));

    let summary = get_room(&state, room_id).await.unwrap();
    assert!(summary.active_participants <= summary.capacity);
}

#[tokio::test]
async fn join_notifies_peers_and_updates_activity() {
    let state = test_helpers::test_app_state();
    let host_id = Uuid::new_v4();
    let (room_id, _host_client, mut host_rx) = host_a_room(&state, host_id, 4).await;

    let member_id = Uuid::new_v4();
    let (_m_client, mut m_rx) = join_as(&state, room_id, member_id, "Mel").await;

    let joined = recv_until(&mut host_rx, "room:participant-joined").await;
    let participant = joined.data.get("participant").expect("participant payload");
    assert_eq!(
        participant.get("user_id").and_then(|v| v.as_str()),
        Some(member_id.to_string().as_str())
    );

    let activity = recv_until(&mut host_rx, "room:activity").await;
    assert_eq!(
        activity.data.get("active_participants").and_then(serde_json::Value::as_u64),
        Some(2)
    );

    // The joiner is not notified about their own join.
    let activity = recv_until(&mut m_rx, "room:activity").await;
    assert_eq!(activity.syscall, "room:activity");
}

#[tokio::test]
async fn rejoin_restores_record_with_stats() {
    let state = test_helpers::test_app_state();
    let host_id = Uuid::new_v4();
    let (room_id, _hc, _hr) = host_a_room(&state, host_id, 4).await;

    let member_id = Uuid::new_v4();
    let (m_client, _m_rx) = join_as(&state, room_id, member_id, "Mel").await;

    // Accumulate stats, then leave.
    {
        let handle = state.room_handle(room_id).await.unwrap();
        let mut room_state = handle.lock().await;
        let p = room_state.room.participant_mut(member_id).unwrap();
        p.answered = 5;
        p.correct = 3;
    }
    leave_room(&state, room_id, member_id, m_client).await;

    let summary = get_room(&state, room_id).await.unwrap();
    assert_eq!(summary.active_participants, 1);

    let (_m_client2, _m_rx2) = join_as(&state, room_id, member_id, "Mel").await;
    let summary = get_room(&state, room_id).await.unwrap();
    // Same record, not a duplicate; stats intact.
    assert_eq!(summary.participants.len(), 2);
    let restored = summary
        .participants
        .iter()
        .find(|p| p.user_id == member_id)
        .unwrap();
    assert!(restored.active);
    assert_eq!(restored.answered, 5);
    assert_eq!(restored.correct, 3);
}

// =============================================================================
// LEAVE
// =============================================================================

#[tokio::test]
async fn leave_room_is_idempotent() {
    let state = test_helpers::test_app_state();
    let host_id = Uuid::new_v4();
    let (room_id, _hc, _hr) = host_a_room(&state, host_id, 4).await;
    let member_id = Uuid::new_v4();
    let (m_client, _m_rx) = join_as(&state, room_id, member_id, "Mel").await;

    leave_room(&state, room_id, member_id, m_client).await;
    let after_first = get_room(&state, room_id).await.unwrap();

    leave_room(&state, room_id, member_id, m_client).await;
    let after_second = get_room(&state, room_id).await.unwrap();

    assert_eq!(after_first.active_participants, after_second.active_participants);
    assert_eq!(after_first.participants.len(), after_second.participants.len());
}

#[tokio::test]
async fn host_departure_promotes_earliest_joined_active() {
    let state = test_helpers::test_app_state();
    let host_id = Uuid::new_v4();
    let (room_id, host_client, _hr) = host_a_room(&state, host_id, 4).await;

    let b_id = Uuid::new_v4();
    let c_id = Uuid::new_v4();
    let (_b_client, mut b_rx) = join_as(&state, room_id, b_id, "B").await;
    let (_c_client, _c_rx) = join_as(&state, room_id, c_id, "C").await;

    leave_room(&state, room_id, host_id, host_client).await;

    // B joined before C, so B inherits the room.
    let summary = get_room(&state, room_id).await.unwrap();
    assert_eq!(summary.host_user_id, b_id);
    let b = summary.participants.iter().find(|p| p.user_id == b_id).unwrap();
    assert_eq!(b.role, Role::Host);
    let host_count = summary
        .participants
        .iter()
        .filter(|p| p.active && p.role == Role::Host)
        .count();
    assert_eq!(host_count, 1);

    let changed = recv_until(&mut b_rx, "room:host-changed").await;
    assert_eq!(
        changed.data.get("host_user_id").and_then(|v| v.as_str()),
        Some(b_id.to_string().as_str())
    );
}

#[tokio::test]
async fn last_departure_closes_and_releases_room() {
    let state = test_helpers::test_app_state();
    let host_id = Uuid::new_v4();
    let (room_id, host_client, _hr) = host_a_room(&state, host_id, 4).await;

    leave_room(&state, room_id, host_id, host_client).await;

    assert!(state.room_handle(room_id).await.is_none());
    assert!(get_room(&state, room_id).await.is_none());
}

#[tokio::test]
async fn close_room_as_requires_host() {
    let state = test_helpers::test_app_state();
    let host_id = Uuid::new_v4();
    let (room_id, _hc, _hr) = host_a_room(&state, host_id, 4).await;
    let member_id = Uuid::new_v4();
    let (_mc, _mr) = join_as(&state, room_id, member_id, "Mel").await;

    let result = close_room_as(&state, room_id, member_id).await;
    assert!(matches!(result.unwrap_err(), RoomError::Authorization(_)));

    close_room_as(&state, room_id, host_id).await.unwrap();
    assert!(state.room_handle(room_id).await.is_none());
}

// =============================================================================
// READY / CHAT / BROADCAST
// =============================================================================

#[tokio::test]
async fn ready_toggle_broadcasts_and_signals_all_ready() {
    let state = test_helpers::test_app_state();
    let host_id = Uuid::new_v4();
    let (room_id, _hc, mut host_rx) = host_a_room(&state, host_id, 4).await;
    let member_id = Uuid::new_v4();
    let (_mc, mut m_rx) = join_as(&state, room_id, member_id, "Mel").await;

    set_ready(&state, room_id, host_id, true).await.unwrap();
    let changed = recv_until(&mut m_rx, "room:ready-changed").await;
    assert_eq!(changed.data.get("ready").and_then(serde_json::Value::as_bool), Some(true));

    // Not everyone is ready yet.
    set_ready(&state, room_id, member_id, true).await.unwrap();
    let all_ready = recv_until(&mut host_rx, "room:all-ready").await;
    assert_eq!(all_ready.status, Status::Request);
}

#[tokio::test]
async fn set_ready_rejects_non_participant() {
    let state = test_helpers::test_app_state();
    let host_id = Uuid::new_v4();
    let (room_id, _hc, _hr) = host_a_room(&state, host_id, 4).await;

    let result = set_ready(&state, room_id, Uuid::new_v4(), true).await;
    assert!(matches!(result.unwrap_err(), RoomError::Conflict(_)));
}

#[tokio::test]
async fn chat_reaches_room_with_identity_and_timestamp() {
    let state = test_helpers::test_app_state();
    let host_id = Uuid::new_v4();
    let (room_id, _hc, mut host_rx) = host_a_room(&state, host_id, 4).await;
    let member_id = Uuid::new_v4();
    let (_mc, mut m_rx) = join_as(&state, room_id, member_id, "Mel").await;

    send_chat(&state, room_id, member_id, "anyone up for math?")
        .await
        .unwrap();

    for rx in [&mut host_rx, &mut m_rx] {
        let msg = recv_until(rx, "chat:message").await;
        assert_eq!(msg.data.get("display_name").and_then(|v| v.as_str()), Some("Mel"));
        assert_eq!(
            msg.data.get("text").and_then(|v| v.as_str()),
            Some("anyone up for math?")
        );
        assert!(msg.data.get("ts").and_then(serde_json::Value::as_i64).unwrap_or(0) > 0);
    }
}

#[tokio::test]
async fn broadcast_skips_excluded_client() {
    let state = test_helpers::test_app_state();
    let host_id = Uuid::new_v4();
    let room_id = test_helpers::seed_room(&state, test_helpers::dummy_room(host_id, 4)).await;

    let client_a = Uuid::new_v4();
    let client_b = Uuid::new_v4();
    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);

    let handle = state.room_handle(room_id).await.unwrap();
    {
        let mut room_state = handle.lock().await;
        room_state.clients.insert(client_a, tx_a);
        room_state.clients.insert(client_b, tx_b);
    }

    let frame = event("room:activity", room_id, Data::new());
    {
        let room_state = handle.lock().await;
        broadcast(&room_state, &frame, Some(client_b));
    }

    let received = recv_frame(&mut rx_a).await;
    assert_eq!(received.syscall, "room:activity");
    assert_channel_empty(&mut rx_b).await;
}

// =============================================================================
// LISTING
// =============================================================================

#[tokio::test]
async fn list_public_rooms_filters_and_sorts() {
    let state = test_helpers::test_app_state();

    // Busy public room: host + 2 members.
    let busy_host = Uuid::new_v4();
    let (busy_id, _c1, _r1) = host_a_room(&state, busy_host, 8).await;
    let (_c2, _r2) = join_as(&state, busy_id, Uuid::new_v4(), "B").await;
    let (_c3, _r3) = join_as(&state, busy_id, Uuid::new_v4(), "C").await;

    // Quiet public room.
    let quiet_host = Uuid::new_v4();
    let (_quiet_id, _c4, _r4) = host_a_room(&state, quiet_host, 8).await;

    // Private room: never listed.
    let mut cfg = config(8);
    cfg.visibility = Visibility::Private;
    cfg.access_code = Some("x".into());
    let (tx, _rx) = mpsc::channel(8);
    create_room(&state, Uuid::new_v4(), &profile("P", "ARMY"), cfg, Uuid::new_v4(), tx)
        .await
        .unwrap();

    let rooms = list_public_rooms(&state, None, None, 10).await;
    assert_eq!(rooms.len(), 2);
    assert_eq!(rooms[0].id, busy_id);
    assert!(rooms[0].active_participants >= rooms[1].active_participants);

    let one = list_public_rooms(&state, None, None, 1).await;
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].id, busy_id);

    // Branch filter matches the host's affiliation ("ARMY" in these tests).
    let army = list_public_rooms(&state, Some("ARMY"), None, 10).await;
    assert_eq!(army.len(), 2);
    let navy = list_public_rooms(&state, Some("NAVY"), None, 10).await;
    assert!(navy.is_empty());
}

#[tokio::test]
async fn list_honors_category_filter() {
    let state = test_helpers::test_app_state();
    let mut cfg = config(8);
    cfg.category = Some("arithmetic_reasoning".into());
    let (tx, _rx) = mpsc::channel(8);
    create_room(&state, Uuid::new_v4(), &profile("H", "ARMY"), cfg, Uuid::new_v4(), tx)
        .await
        .unwrap();

    let hits = list_public_rooms(&state, None, Some("arithmetic_reasoning"), 10).await;
    assert_eq!(hits.len(), 1);
    let misses = list_public_rooms(&state, None, Some("word_knowledge"), 10).await;
    assert!(misses.is_empty());
}
