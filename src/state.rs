//! Shared application state and the room/session domain model.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the room registry and the backend collaborator handles. Each
//! live room is one `RoomState` behind its own `Mutex` — the unit of
//! mutual exclusion. The outer registry map is only locked long enough to
//! look up, insert, or remove a room handle, so commands against
//! different rooms never contend.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use uuid::Uuid;

use crate::backend::{Question, QuestionStore, SessionArchive, TokenVerifier, UserDirectory};
use crate::config::GatewayConfig;
use crate::frame::{Frame, now_ms};

// =============================================================================
// PARTICIPANT
// =============================================================================

/// Room-scoped role. Exactly one active participant holds `Host` while
/// the room is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Member,
}

/// A room-scoped membership record, distinct from the user identity.
/// Created on first join, marked inactive on leave, removed only when the
/// room closes.
#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub user_id: Uuid,
    pub display_name: String,
    pub branch: String,
    pub role: Role,
    pub active: bool,
    pub ready: bool,
    /// Questions answered across the room's sessions.
    pub answered: u32,
    /// Correct answers across the room's sessions.
    pub correct: u32,
    pub joined_ts: i64,
    /// Monotonic join order within the room. Drives host succession and
    /// initial leaderboard order even when timestamps collide.
    pub join_seq: u64,
}

impl Participant {
    #[must_use]
    pub fn new(user_id: Uuid, display_name: String, branch: String, role: Role, join_seq: u64) -> Self {
        Self {
            user_id,
            display_name,
            branch,
            role,
            active: true,
            ready: false,
            answered: 0,
            correct: 0,
            joined_ts: now_ms(),
            join_seq,
        }
    }

    /// Cumulative accuracy as a rounded percentage, 0-100.
    #[must_use]
    pub fn accuracy_pct(&self) -> u8 {
        if self.answered == 0 {
            return 0;
        }
        let pct = f64::from(self.correct) / f64::from(self.answered) * 100.0;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            pct.round() as u8
        }
    }
}

// =============================================================================
// ROOM
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

/// Quiz settings fixed at room creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSettings {
    /// Per-question time limit in milliseconds. `None` disables the
    /// speed bonus and the optional server-side timeout.
    pub time_limit_ms: Option<u64>,
    pub question_count: usize,
    pub difficulty: Option<String>,
    pub show_leaderboard: bool,
    pub allow_hints: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            time_limit_ms: Some(30_000),
            question_count: 10,
            difficulty: None,
            show_leaderboard: true,
            allow_hints: false,
        }
    }
}

/// A study room: a grouping of participants around a shared topic,
/// persistent while open.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub host_user_id: Uuid,
    pub category: Option<String>,
    pub capacity: usize,
    pub visibility: Visibility,
    /// Required to join when visibility is `Private`. Never serialized to
    /// clients.
    pub access_code: Option<String>,
    pub settings: RoomSettings,
    /// Ordered by join time (see `Participant::join_seq`).
    pub participants: Vec<Participant>,
    pub status: RoomStatus,
    pub created_ts: i64,
    pub started_ts: Option<i64>,
}

impl Room {
    /// Count of participants currently active. Never exceeds capacity.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.participants.iter().filter(|p| p.active).count()
    }

    #[must_use]
    pub fn participant(&self, user_id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: Uuid) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }
}

// =============================================================================
// QUIZ SESSION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    InProgress,
    Completed,
}

/// Per-question sub-cycle inside `InProgress`: answers are collected,
/// then results are shown until the advance timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionPhase {
    Collecting,
    Revealing,
}

/// One participant's response to the current question.
#[derive(Debug, Clone)]
pub struct AnswerRecord {
    pub answer: String,
    pub latency_ms: u64,
    pub correct: bool,
    pub answered_ts: i64,
}

/// Live leaderboard row. Kept sorted by descending score; ties broken by
/// earliest `last_scored_ts`, then join order.
#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub user_id: Uuid,
    pub display_name: String,
    pub score: i64,
    /// Rounded percentage, 0-100.
    pub accuracy: u8,
    pub rank: u32,
    /// When this participant reached their current cumulative score.
    #[serde(skip)]
    pub last_scored_ts: i64,
    #[serde(skip)]
    pub join_seq: u64,
}

/// One timed, ordered run of a quiz within a room. Only reachable through
/// its owning room.
#[derive(Debug)]
pub struct QuizSession {
    pub id: Uuid,
    pub room_id: Uuid,
    /// Fixed at session start. Correct answers and explanations live here
    /// and are only released per-question at results time.
    pub questions: Vec<Question>,
    pub current_index: usize,
    pub status: SessionStatus,
    pub phase: QuestionPhase,
    /// Responses for the current question only, keyed by user id.
    pub responses: HashMap<Uuid, AnswerRecord>,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub started_ts: i64,
}

impl QuizSession {
    /// The question currently being played.
    ///
    /// # Panics
    ///
    /// Panics if the session is `InProgress` with an out-of-range index —
    /// a broken invariant, not a recoverable condition.
    #[must_use]
    pub fn current_question(&self) -> &Question {
        self.questions
            .get(self.current_index)
            .expect("in-progress session must have a current question")
    }

    #[must_use]
    pub fn is_last_question(&self) -> bool {
        self.current_index + 1 >= self.questions.len()
    }
}

// =============================================================================
// ROOM STATE
// =============================================================================

/// Per-room live state: the room record, its optional quiz session, and
/// the connected clients subscribed to its broadcast group.
pub struct RoomState {
    pub room: Room,
    pub session: Option<QuizSession>,
    /// Connected clients: `client_id` -> sender for outgoing frames.
    pub clients: HashMap<Uuid, mpsc::Sender<Frame>>,
    /// `client_id` -> authenticated user id, for roster bookkeeping.
    pub client_users: HashMap<Uuid, Uuid>,
    pub next_join_seq: u64,
}

impl RoomState {
    #[must_use]
    pub fn new(room: Room) -> Self {
        Self {
            room,
            session: None,
            clients: HashMap::new(),
            client_users: HashMap::new(),
            next_join_seq: 0,
        }
    }
}

/// Handle to one room's serialized state.
pub type RoomHandle = Arc<Mutex<RoomState>>;

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via the State
/// extractor. Clone is required by Axum — all inner fields are Arc-wrapped
/// or Copy.
#[derive(Clone)]
pub struct AppState {
    /// Active rooms. The outer lock guards the map only; room state is
    /// serialized by each room's own mutex.
    pub rooms: Arc<RwLock<HashMap<Uuid, RoomHandle>>>,
    pub directory: Arc<dyn UserDirectory>,
    pub questions: Arc<dyn QuestionStore>,
    pub archive: Arc<dyn SessionArchive>,
    pub tokens: Arc<dyn TokenVerifier>,
    pub config: GatewayConfig,
}

impl AppState {
    #[must_use]
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        questions: Arc<dyn QuestionStore>,
        archive: Arc<dyn SessionArchive>,
        tokens: Arc<dyn TokenVerifier>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            directory,
            questions,
            archive,
            tokens,
            config,
        }
    }

    /// Look up a room handle by id. The registry lock is released before
    /// the handle is returned.
    pub async fn room_handle(&self, room_id: Uuid) -> Option<RoomHandle> {
        let rooms = self.rooms.read().await;
        rooms.get(&room_id).cloned()
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use crate::backend::mock::MockBackend;

    /// Create a test `AppState` backed by an empty mock backend.
    #[must_use]
    pub fn test_app_state() -> AppState {
        test_app_state_with_backend(Arc::new(MockBackend::new()))
    }

    /// Create a test `AppState` sharing one mock across all four
    /// collaborator roles, so tests can seed and inspect it.
    #[must_use]
    pub fn test_app_state_with_backend(mock: Arc<MockBackend>) -> AppState {
        AppState::new(
            mock.clone(),
            mock.clone(),
            mock.clone(),
            mock,
            GatewayConfig { results_display_ms: 10, ..GatewayConfig::default() },
        )
    }

    /// Build a room record without going through `create_room`.
    #[must_use]
    pub fn dummy_room(host_user_id: Uuid, capacity: usize) -> Room {
        Room {
            id: Uuid::new_v4(),
            name: "ASVAB prep".into(),
            description: None,
            host_user_id,
            category: None,
            capacity,
            visibility: Visibility::Public,
            access_code: None,
            settings: RoomSettings::default(),
            participants: Vec::new(),
            status: RoomStatus::Open,
            created_ts: now_ms(),
            started_ts: None,
        }
    }

    /// Seed a room (with its host as first participant) into the registry
    /// and return its id.
    pub async fn seed_room(state: &AppState, mut room: Room) -> Uuid {
        let room_id = room.id;
        let host = Participant::new(room.host_user_id, "Host".into(), "ARMY".into(), Role::Host, 0);
        room.participants.push(host);
        let mut room_state = RoomState::new(room);
        room_state.next_join_seq = 1;
        let mut rooms = state.rooms.write().await;
        rooms.insert(room_id, Arc::new(Mutex::new(room_state)));
        room_id
    }
}
