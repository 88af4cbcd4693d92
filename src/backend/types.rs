//! Backend types — collaborator payloads and errors.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ERROR
// =============================================================================

/// Errors produced by backend collaborator calls.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend base URL is not configured.
    #[error("backend not configured: BACKEND_BASE_URL unset")]
    Unconfigured,

    /// The HTTP request to the backend failed (network, timeout).
    #[error("backend request failed: {0}")]
    Request(String),

    /// The backend returned a non-success HTTP status.
    #[error("backend response error: status {status}")]
    Status { status: u16, body: String },

    /// The backend response body could not be deserialized.
    #[error("backend response parse failed: {0}")]
    Decode(String),
}

impl crate::frame::ErrorCode for BackendError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unconfigured => "E_BACKEND_UNCONFIGURED",
            Self::Request(_) => "E_BACKEND_REQUEST",
            Self::Status { .. } => "E_BACKEND_STATUS",
            Self::Decode(_) => "E_BACKEND_DECODE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Status { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// USER DIRECTORY
// =============================================================================

/// Profile fields the realtime core needs for presence display.
#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    pub display_name: String,
    /// Military branch affiliation, e.g. "ARMY", "NAVY".
    pub branch: String,
}

// =============================================================================
// QUESTION STORE
// =============================================================================

/// Filter passed to the question store.
#[derive(Debug, Clone, Default)]
pub struct QuestionFilter {
    pub category: Option<String>,
    pub difficulty: Option<String>,
}

/// A quiz question as served by the question store.
///
/// `correct_answer` and `explanation` stay server-side: client payloads
/// are built field-by-field and never include them before the question's
/// results phase. This type deliberately does not implement `Serialize`.
#[derive(Debug, Clone, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub content: String,
    pub options: Vec<String>,
    pub correct_answer: String,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
}

// =============================================================================
// SESSION ARCHIVE
// =============================================================================

/// Final standing row archived with a completed session.
#[derive(Debug, Clone, Serialize)]
pub struct StandingRow {
    pub user_id: Uuid,
    pub display_name: String,
    pub score: i64,
    /// Rounded percentage, 0-100.
    pub accuracy: u8,
    pub rank: u32,
}

/// Snapshot of a completed (or abandoned) quiz session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub room_id: Uuid,
    pub total_questions: usize,
    pub questions_played: usize,
    pub duration_ms: i64,
    /// True when the session ended early (room closed mid-quiz).
    pub abandoned: bool,
    pub standings: Vec<StandingRow>,
}
