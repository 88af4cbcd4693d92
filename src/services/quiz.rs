//! Quiz service — session lifecycle, scoring, and the leaderboard.
//!
//! DESIGN
//! ======
//! One quiz session runs per room at a time: `WAITING → IN_PROGRESS →
//! COMPLETED`, with a per-question sub-cycle of collecting answers, then
//! revealing results, then advancing. All mutations happen under the
//! owning room's lock; the results-display delay and the optional hard
//! question timeout run on spawned timers that re-acquire the lock and
//! re-validate (session id, question index, phase) before acting, so a
//! stale timer is a no-op.
//!
//! SCORING
//! =======
//! Correct answers earn `100 + bonus`, where the bonus scales linearly
//! with remaining time up to 50 points when the room has a time limit.
//! Leaderboard order: descending score, ties broken by the earliest time
//! a participant reached their current cumulative score, then join order.

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, QuestionFilter};
use crate::frame::{Data, now_ms};
use crate::services::{archive, room};
use crate::state::{
    AnswerRecord, AppState, LeaderboardEntry, QuestionPhase, QuizSession, RoomState, RoomStatus,
    SessionStatus,
};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QuizError {
    #[error("room not found: {0}")]
    RoomNotFound(Uuid),
    #[error("no questions matched the room's filters")]
    NoQuestions,
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl crate::frame::ErrorCode for QuizError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) | Self::NoQuestions => "E_NOT_FOUND",
            Self::Authorization(_) => "E_AUTHORIZATION",
            Self::Validation(_) => "E_VALIDATION",
            Self::Conflict(_) => "E_CONFLICT",
            Self::Backend(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.retryable(),
            _ => false,
        }
    }
}

/// Client-safe view of one question. Never carries the correct answer or
/// the explanation.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionView {
    pub question_id: Uuid,
    pub index: usize,
    pub total: usize,
    pub content: String,
    pub options: Vec<String>,
    pub time_limit_ms: Option<u64>,
}

/// Client-safe view of a session for replies and polling reads.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub room_id: Uuid,
    pub status: SessionStatus,
    pub current_index: usize,
    pub total_questions: usize,
    pub answered_count: usize,
    pub question: Option<QuestionView>,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub started_ts: i64,
}

/// Private result returned to the submitting participant.
#[derive(Debug, Serialize)]
pub struct AnswerVerdict {
    pub is_correct: bool,
    /// Present only for incorrect answers, so content is not leaked to a
    /// participant who already scored.
    pub explanation: Option<String>,
    pub awarded: i64,
    pub total_score: i64,
}

// =============================================================================
// SCORING
// =============================================================================

/// Points awarded for one answer. Base 100 plus a speed bonus of up to
/// 50, linear in remaining time. Incorrect answers earn nothing.
#[must_use]
pub fn score_for(time_limit_ms: Option<u64>, latency_ms: u64, correct: bool) -> i64 {
    if !correct {
        return 0;
    }
    let bonus = match time_limit_ms {
        Some(limit) if limit > 0 => {
            #[allow(clippy::cast_precision_loss)]
            let fraction = limit.saturating_sub(latency_ms) as f64 / limit as f64;
            #[allow(clippy::cast_possible_truncation)]
            {
                (fraction * 50.0).round() as i64
            }
        }
        _ => 0,
    };
    100 + bonus
}

/// Re-sort the leaderboard and reassign ranks 1..N.
pub fn resort_leaderboard(entries: &mut [LeaderboardEntry]) {
    entries.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.last_scored_ts.cmp(&b.last_scored_ts))
            .then_with(|| a.join_seq.cmp(&b.join_seq))
    });
    for (idx, entry) in entries.iter_mut().enumerate() {
        entry.rank = u32::try_from(idx + 1).unwrap_or(u32::MAX);
    }
}

// =============================================================================
// START
// =============================================================================

/// Start a quiz session in a room. Host-only. Fetches and shuffles the
/// question set, seeds the leaderboard with every ready participant in
/// join order, and broadcasts the first question.
///
/// # Errors
///
/// `Authorization` when the requester is not the host, `Validation` when
/// no active participant is ready, `NoQuestions` when the store has no
/// match, `Conflict` when a session is already running.
pub async fn start_session(
    state: &AppState,
    room_id: Uuid,
    requesting_user_id: Uuid,
) -> Result<SessionSummary, QuizError> {
    // PHASE: VALIDATE AND SNAPSHOT SETTINGS
    // The question fetch is backend I/O, so it must not run under the
    // room lock; settings are copied out and everything is re-checked
    // after the fetch.
    let (filter, desired) = {
        let handle = state
            .room_handle(room_id)
            .await
            .ok_or(QuizError::RoomNotFound(room_id))?;
        let room_state = handle.lock().await;
        validate_start(&room_state, requesting_user_id)?;
        (
            QuestionFilter {
                category: room_state.room.category.clone(),
                difficulty: room_state.room.settings.difficulty.clone(),
            },
            room_state.room.settings.question_count,
        )
    };

    // PHASE: FETCH QUESTION SET
    let mut questions = state.questions.find_questions(&filter, desired).await?;
    if questions.is_empty() {
        return Err(QuizError::NoQuestions);
    }
    {
        use rand::seq::SliceRandom;
        questions.shuffle(&mut rand::rng());
    }
    questions.truncate(desired);

    // PHASE: INSTALL SESSION
    let handle = state
        .room_handle(room_id)
        .await
        .ok_or(QuizError::RoomNotFound(room_id))?;
    let mut room_state = handle.lock().await;
    validate_start(&room_state, requesting_user_id)?;

    let started_ts = now_ms();
    let mut ready: Vec<_> = room_state
        .room
        .participants
        .iter()
        .filter(|p| p.active && p.ready)
        .collect();
    ready.sort_by_key(|p| p.join_seq);
    let leaderboard: Vec<LeaderboardEntry> = ready
        .iter()
        .enumerate()
        .map(|(idx, p)| LeaderboardEntry {
            user_id: p.user_id,
            display_name: p.display_name.clone(),
            score: 0,
            accuracy: p.accuracy_pct(),
            rank: u32::try_from(idx + 1).unwrap_or(u32::MAX),
            last_scored_ts: started_ts,
            join_seq: p.join_seq,
        })
        .collect();

    let session = QuizSession {
        id: Uuid::new_v4(),
        room_id,
        questions,
        current_index: 0,
        status: SessionStatus::InProgress,
        phase: QuestionPhase::Collecting,
        responses: std::collections::HashMap::new(),
        leaderboard,
        started_ts,
    };
    let session_id = session.id;
    room_state.room.started_ts = Some(started_ts);
    room_state.session = Some(session);

    let mut data = Data::new();
    data.insert("session_id".into(), serde_json::json!(session_id));
    let session_ref = room_state.session.as_ref().expect("session just installed");
    data.insert("total_questions".into(), serde_json::json!(session_ref.questions.len()));
    data.insert(
        "leaderboard".into(),
        serde_json::to_value(&session_ref.leaderboard).unwrap_or_default(),
    );
    let frame = room::event("quiz:started", room_id, data);
    room::broadcast(&room_state, &frame, None);

    open_current_question(state, &mut room_state);

    info!(%room_id, %session_id, questions = room_state.session.as_ref().map_or(0, |s| s.questions.len()), "quiz session started");
    Ok(summarize_session(room_state.session.as_ref().expect("session just installed")))
}

fn validate_start(room_state: &RoomState, requesting_user_id: Uuid) -> Result<(), QuizError> {
    let room = &room_state.room;
    if room.status != RoomStatus::Open {
        return Err(QuizError::RoomNotFound(room.id));
    }
    if room.host_user_id != requesting_user_id {
        return Err(QuizError::Authorization("only the host can start a quiz".into()));
    }
    if room_state
        .session
        .as_ref()
        .is_some_and(|s| s.status == SessionStatus::InProgress)
    {
        return Err(QuizError::Conflict("a session is already in progress".into()));
    }
    if !room.participants.iter().any(|p| p.active && p.ready) {
        return Err(QuizError::Validation("no ready participants".into()));
    }
    Ok(())
}

// =============================================================================
// SUBMIT
// =============================================================================

/// Record one participant's answer to the current question, score it,
/// re-rank the leaderboard, and complete the question if this was the
/// last outstanding answer.
///
/// # Errors
///
/// `Conflict` when there is no collecting question, the user is not a
/// session participant, or the user already answered.
pub async fn submit_answer(
    state: &AppState,
    room_id: Uuid,
    user_id: Uuid,
    answer: &str,
    latency_ms: u64,
) -> Result<AnswerVerdict, QuizError> {
    let handle = state
        .room_handle(room_id)
        .await
        .ok_or(QuizError::RoomNotFound(room_id))?;
    let mut room_state = handle.lock().await;
    let time_limit_ms = room_state.room.settings.time_limit_ms;
    let show_leaderboard = room_state.room.settings.show_leaderboard;

    let session = room_state
        .session
        .as_mut()
        .filter(|s| s.status == SessionStatus::InProgress)
        .ok_or_else(|| QuizError::Conflict("no quiz in progress".into()))?;
    if session.phase != QuestionPhase::Collecting {
        return Err(QuizError::Conflict("question is not accepting answers".into()));
    }
    if !session.leaderboard.iter().any(|e| e.user_id == user_id) {
        return Err(QuizError::Conflict("not a session participant".into()));
    }
    if session.responses.contains_key(&user_id) {
        return Err(QuizError::Conflict("already answered this question".into()));
    }

    let question = session.current_question();
    let is_correct = answer == question.correct_answer;
    let explanation = if is_correct {
        None
    } else {
        Some(
            question
                .explanation
                .clone()
                .unwrap_or_else(|| format!("The correct answer is {}.", question.correct_answer)),
        )
    };

    let answered_ts = now_ms();
    session.responses.insert(
        user_id,
        AnswerRecord { answer: answer.to_string(), latency_ms, correct: is_correct, answered_ts },
    );

    let awarded = score_for(time_limit_ms, latency_ms, is_correct);

    // Running stats live on the room-scoped participant record.
    let accuracy = {
        let participant = room_state
            .room
            .participant_mut(user_id)
            .expect("session participant must exist in room");
        participant.answered += 1;
        if is_correct {
            participant.correct += 1;
        }
        participant.accuracy_pct()
    };

    let session = room_state.session.as_mut().expect("session checked above");
    let entry = session
        .leaderboard
        .iter_mut()
        .find(|e| e.user_id == user_id)
        .expect("leaderboard entry checked above");
    entry.score += awarded;
    entry.accuracy = accuracy;
    if awarded > 0 {
        entry.last_scored_ts = answered_ts;
    }
    let total_score = entry.score;
    resort_leaderboard(&mut session.leaderboard);

    if show_leaderboard {
        broadcast_leaderboard(&room_state);
    }

    complete_question_if_ready(state, &mut room_state);

    Ok(AnswerVerdict { is_correct, explanation, awarded, total_score })
}

// =============================================================================
// QUESTION COMPLETION
// =============================================================================

/// Complete the current question when every *currently active* session
/// participant has answered. Called after each answer and after each
/// departure, so a participant who disconnects mid-question can never
/// stall advancement. No-op outside a collecting question.
pub(crate) fn complete_question_if_ready(state: &AppState, room_state: &mut RoomState) {
    let Some(session) = room_state.session.as_ref() else {
        return;
    };
    if session.status != SessionStatus::InProgress || session.phase != QuestionPhase::Collecting {
        return;
    }

    let outstanding = room_state.room.participants.iter().any(|p| {
        p.active
            && session.leaderboard.iter().any(|e| e.user_id == p.user_id)
            && !session.responses.contains_key(&p.user_id)
    });
    let anyone_active = room_state.room.participants.iter().any(|p| {
        p.active && session.leaderboard.iter().any(|e| e.user_id == p.user_id)
    });
    if !anyone_active {
        // Every session participant disconnected mid-question. Ending the
        // session beats looping on a question nobody can answer. (An empty
        // room never reaches this point; departure handling closes it.)
        finish_session(state, room_state, true);
        return;
    }
    if outstanding {
        return;
    }

    complete_current_question(state, room_state);
}

/// Reveal the current question's results and schedule the advance.
fn complete_current_question(state: &AppState, room_state: &mut RoomState) {
    let room_id = room_state.room.id;
    let (session_id, index, data) = {
        let session = room_state.session.as_mut().expect("caller checked session");
        session.phase = QuestionPhase::Revealing;
        let session = &*session;

        let question = session.current_question();
        let results: Vec<serde_json::Value> = session
            .responses
            .iter()
            .map(|(user_id, record)| {
                let display_name = room_state
                    .room
                    .participant(*user_id)
                    .map_or("unknown", |p| p.display_name.as_str());
                serde_json::json!({
                    "user_id": user_id,
                    "display_name": display_name,
                    "answer": record.answer,
                    "correct": record.correct,
                    "latency_ms": record.latency_ms,
                })
            })
            .collect();

        let mut data = Data::new();
        data.insert("question_id".into(), serde_json::json!(question.id));
        data.insert("index".into(), serde_json::json!(session.current_index));
        data.insert("correct_answer".into(), serde_json::json!(question.correct_answer));
        data.insert("explanation".into(), serde_json::json!(question.explanation));
        data.insert("responses".into(), serde_json::json!(results));
        (session.id, session.current_index, data)
    };

    let frame = room::event("quiz:question-results", room_id, data);
    room::broadcast(room_state, &frame, None);

    let delay = state.config.results_display_delay();
    let state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        advance_after_reveal(&state, room_id, session_id, index).await;
    });
}

/// Advance timer body: move to the next question or finish the session.
/// Validates that the same session is still revealing the same question —
/// a closed room or a replaced session makes this a no-op.
async fn advance_after_reveal(state: &AppState, room_id: Uuid, session_id: Uuid, index: usize) {
    let Some(handle) = state.room_handle(room_id).await else {
        return;
    };
    let mut room_state = handle.lock().await;
    let Some(session) = room_state.session.as_mut() else {
        return;
    };
    if session.id != session_id
        || session.status != SessionStatus::InProgress
        || session.phase != QuestionPhase::Revealing
        || session.current_index != index
    {
        return;
    }

    if session.is_last_question() {
        finish_session(state, &mut room_state, false);
        return;
    }

    session.responses.clear();
    session.current_index += 1;
    session.phase = QuestionPhase::Collecting;
    open_current_question(state, &mut room_state);
}

/// Broadcast the current question (answer and explanation stripped) and
/// arm the optional hard timeout.
fn open_current_question(state: &AppState, room_state: &mut RoomState) {
    let room_id = room_state.room.id;
    let time_limit_ms = room_state.room.settings.time_limit_ms;
    let session = room_state.session.as_ref().expect("caller checked session");
    let view = question_view(session, time_limit_ms);

    let mut data = Data::new();
    data.insert("question".into(), serde_json::to_value(&view).unwrap_or_default());
    let frame = room::event("quiz:question", room_id, data);
    room::broadcast(room_state, &frame, None);

    if state.config.question_timeout_enforced {
        if let Some(limit) = time_limit_ms {
            let session_id = session.id;
            let index = session.current_index;
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(limit)).await;
                force_complete_question(&state, room_id, session_id, index).await;
            });
        }
    }
}

/// Hard-timeout timer body: score every unanswered active participant as
/// incorrect, then complete the question. Stale timers are no-ops.
async fn force_complete_question(state: &AppState, room_id: Uuid, session_id: Uuid, index: usize) {
    let Some(handle) = state.room_handle(room_id).await else {
        return;
    };
    let mut room_state = handle.lock().await;
    let Some(session) = room_state.session.as_ref() else {
        return;
    };
    if session.id != session_id
        || session.status != SessionStatus::InProgress
        || session.phase != QuestionPhase::Collecting
        || session.current_index != index
    {
        return;
    }

    let limit = room_state.room.settings.time_limit_ms.unwrap_or(0);
    let unanswered: Vec<Uuid> = room_state
        .room
        .participants
        .iter()
        .filter(|p| {
            p.active
                && session.leaderboard.iter().any(|e| e.user_id == p.user_id)
                && !session.responses.contains_key(&p.user_id)
        })
        .map(|p| p.user_id)
        .collect();

    warn!(%room_id, %session_id, index, count = unanswered.len(), "question timed out; scoring unanswered as incorrect");

    let now = now_ms();
    for user_id in unanswered {
        let accuracy = {
            let participant = room_state
                .room
                .participant_mut(user_id)
                .expect("session participant must exist in room");
            participant.answered += 1;
            participant.accuracy_pct()
        };
        let session = room_state.session.as_mut().expect("session checked above");
        session.responses.insert(
            user_id,
            AnswerRecord { answer: String::new(), latency_ms: limit, correct: false, answered_ts: now },
        );
        if let Some(entry) = session.leaderboard.iter_mut().find(|e| e.user_id == user_id) {
            entry.accuracy = accuracy;
        }
    }

    let session = room_state.session.as_mut().expect("session checked above");
    resort_leaderboard(&mut session.leaderboard);
    if room_state.room.settings.show_leaderboard {
        broadcast_leaderboard(&room_state);
    }
    complete_current_question(state, &mut room_state);
}

/// Mark the session completed, publish the final standings, and hand the
/// snapshot to the archive. The room returns to its open, idle state.
fn finish_session(state: &AppState, room_state: &mut RoomState, abandoned: bool) {
    let room_id = room_state.room.id;
    let session = room_state.session.as_mut().expect("caller checked session");
    session.status = SessionStatus::Completed;
    let duration_ms = now_ms() - session.started_ts;

    let mut data = Data::new();
    data.insert("session_id".into(), serde_json::json!(session.id));
    data.insert("total_questions".into(), serde_json::json!(session.questions.len()));
    data.insert("duration_ms".into(), serde_json::json!(duration_ms));
    data.insert("abandoned".into(), serde_json::json!(abandoned));
    data.insert(
        "leaderboard".into(),
        serde_json::to_value(&session.leaderboard).unwrap_or_default(),
    );
    let frame = room::event("quiz:completed", room_id, data);
    room::broadcast(room_state, &frame, None);

    let snapshot =
        archive::snapshot_of(&room_state.room, room_state.session.as_ref().expect("session set"), abandoned);
    archive::persist_fire_and_forget(state, snapshot);
    info!(%room_id, duration_ms, abandoned, "quiz session completed");
}

fn broadcast_leaderboard(room_state: &RoomState) {
    let session = room_state.session.as_ref().expect("caller checked session");
    let mut data = Data::new();
    data.insert(
        "leaderboard".into(),
        serde_json::to_value(&session.leaderboard).unwrap_or_default(),
    );
    let frame = room::event("quiz:leaderboard", room_state.room.id, data);
    room::broadcast(room_state, &frame, None);
}

// =============================================================================
// READS
// =============================================================================

fn question_view(session: &QuizSession, time_limit_ms: Option<u64>) -> QuestionView {
    let question = session.current_question();
    QuestionView {
        question_id: question.id,
        index: session.current_index,
        total: session.questions.len(),
        content: question.content.clone(),
        options: question.options.clone(),
        time_limit_ms,
    }
}

#[must_use]
pub fn summarize_session(session: &QuizSession) -> SessionSummary {
    SessionSummary {
        id: session.id,
        room_id: session.room_id,
        status: session.status,
        current_index: session.current_index,
        total_questions: session.questions.len(),
        answered_count: session.responses.len(),
        question: None,
        leaderboard: session.leaderboard.clone(),
        started_ts: session.started_ts,
    }
}

/// Fetch the room's current session. Pure read; `None` when the room is
/// unknown or has never run a quiz. The current question view is included
/// only while answers are being collected.
pub async fn get_session(state: &AppState, room_id: Uuid) -> Option<SessionSummary> {
    let handle = state.room_handle(room_id).await?;
    let room_state = handle.lock().await;
    let session = room_state.session.as_ref()?;
    let mut summary = summarize_session(session);
    if session.status == SessionStatus::InProgress && session.phase == QuestionPhase::Collecting {
        summary.question = Some(question_view(session, room_state.room.settings.time_limit_ms));
    }
    Some(summary)
}

#[cfg(test)]
#[path = "quiz_test.rs"]
mod tests;
