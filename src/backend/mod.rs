//! Backend — adapters for the product's external collaborators.
//!
//! ARCHITECTURE
//! ============
//! The realtime core does not own users, questions, or durable storage.
//! Those live in the product's CRUD backend and are consumed through four
//! narrow async traits: token verification, the user directory, the
//! question store, and the completed-session archive. `HttpBackend` is the
//! production implementation; tests use `mock::MockBackend`.

pub mod http;
#[cfg(test)]
pub mod mock;
pub mod types;

use uuid::Uuid;

pub use http::HttpBackend;
pub use types::{BackendError, Question, QuestionFilter, SessionSnapshot, UserProfile};

// =============================================================================
// COLLABORATOR TRAITS
// =============================================================================

/// Verifies a connection token and resolves it to a user id.
#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Returns `Ok(None)` for a well-formed but invalid/expired token.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the verification call itself fails.
    async fn verify(&self, token: &str) -> Result<Option<Uuid>, BackendError>;
}

/// Supplies display name and branch affiliation for a user id.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    /// Returns `Ok(None)` when the user does not exist.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the lookup call fails.
    async fn profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, BackendError>;
}

/// Supplies question content by filtered query. Read-only.
#[async_trait::async_trait]
pub trait QuestionStore: Send + Sync {
    /// Fetch up to `desired` questions matching `filter`. May return fewer.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the query fails.
    async fn find_questions(&self, filter: &QuestionFilter, desired: usize) -> Result<Vec<Question>, BackendError>;
}

/// Receives completed-session snapshots for durable storage.
#[async_trait::async_trait]
pub trait SessionArchive: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the write fails. Callers treat this
    /// as non-fatal and log it.
    async fn persist_completed(&self, snapshot: &SessionSnapshot) -> Result<(), BackendError>;
}
