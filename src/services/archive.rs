//! Archive service — fire-and-forget persistence of finished sessions.
//!
//! ERROR HANDLING
//! ==============
//! The live session never depends on the archive: a failed write is
//! logged and dropped. Durable history is the backend's concern.

use tracing::warn;

use crate::backend::types::{SessionSnapshot, StandingRow};
use crate::state::{AppState, QuizSession, Room};

/// Build the archival snapshot for a finished or abandoned session.
#[must_use]
pub fn snapshot_of(room: &Room, session: &QuizSession, abandoned: bool) -> SessionSnapshot {
    let standings = session
        .leaderboard
        .iter()
        .map(|entry| StandingRow {
            user_id: entry.user_id,
            display_name: entry.display_name.clone(),
            score: entry.score,
            accuracy: entry.accuracy,
            rank: entry.rank,
        })
        .collect();

    let questions_played = if abandoned {
        session.current_index
    } else {
        session.questions.len()
    };

    SessionSnapshot {
        session_id: session.id,
        room_id: room.id,
        total_questions: session.questions.len(),
        questions_played,
        duration_ms: crate::frame::now_ms() - session.started_ts,
        abandoned,
        standings,
    }
}

/// Spawn a task that hands the snapshot to the session archive. Failures
/// are logged, never surfaced to participants.
pub fn persist_fire_and_forget(state: &AppState, snapshot: SessionSnapshot) {
    let archive = state.archive.clone();
    tokio::spawn(async move {
        if let Err(e) = archive.persist_completed(&snapshot).await {
            warn!(error = %e, session_id = %snapshot.session_id, "session archive failed");
        }
    });
}
