//! In-memory backend mock for unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use super::types::{BackendError, Question, QuestionFilter, SessionSnapshot, UserProfile};
use super::{QuestionStore, SessionArchive, TokenVerifier, UserDirectory};

/// Canned backend. Profiles and tokens are looked up from maps; questions
/// are filtered like the real store; archived snapshots are recorded for
/// assertions.
#[derive(Default)]
pub struct MockBackend {
    pub profiles: HashMap<Uuid, UserProfile>,
    pub tokens: HashMap<String, Uuid>,
    pub questions: Vec<Question>,
    /// When true, every profile lookup fails with a request error.
    pub fail_profiles: bool,
    /// When true, archival fails with a request error.
    pub fail_archive: bool,
    pub archived: Mutex<Vec<SessionSnapshot>>,
}

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, user_id: Uuid, display_name: &str, branch: &str) -> Self {
        self.profiles
            .insert(user_id, UserProfile { display_name: display_name.into(), branch: branch.into() });
        self
    }

    pub fn with_token(mut self, token: &str, user_id: Uuid) -> Self {
        self.tokens.insert(token.into(), user_id);
        self
    }

    pub fn with_questions(mut self, questions: Vec<Question>) -> Self {
        self.questions = questions;
        self
    }

    pub fn archived_snapshots(&self) -> Vec<SessionSnapshot> {
        self.archived.lock().expect("mock mutex should lock").clone()
    }
}

/// Build a plain multiple-choice question for tests.
#[must_use]
pub fn question(content: &str, correct: &str, category: Option<&str>) -> Question {
    Question {
        id: Uuid::new_v4(),
        content: content.into(),
        options: vec!["alpha".into(), correct.into(), "gamma".into()],
        correct_answer: correct.into(),
        explanation: Some(format!("The answer is {correct}.")),
        category: category.map(String::from),
        difficulty: None,
    }
}

#[async_trait::async_trait]
impl TokenVerifier for MockBackend {
    async fn verify(&self, token: &str) -> Result<Option<Uuid>, BackendError> {
        Ok(self.tokens.get(token).copied())
    }
}

#[async_trait::async_trait]
impl UserDirectory for MockBackend {
    async fn profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, BackendError> {
        if self.fail_profiles {
            return Err(BackendError::Request("mock directory down".into()));
        }
        Ok(self.profiles.get(&user_id).cloned())
    }
}

#[async_trait::async_trait]
impl QuestionStore for MockBackend {
    async fn find_questions(&self, filter: &QuestionFilter, desired: usize) -> Result<Vec<Question>, BackendError> {
        let matches: Vec<Question> = self
            .questions
            .iter()
            .filter(|q| {
                filter.category.as_ref().is_none_or(|c| q.category.as_ref() == Some(c))
                    && filter.difficulty.as_ref().is_none_or(|d| q.difficulty.as_ref() == Some(d))
            })
            .take(desired)
            .cloned()
            .collect();
        Ok(matches)
    }
}

#[async_trait::async_trait]
impl SessionArchive for MockBackend {
    async fn persist_completed(&self, snapshot: &SessionSnapshot) -> Result<(), BackendError> {
        if self.fail_archive {
            return Err(BackendError::Request("mock archive down".into()));
        }
        self.archived
            .lock()
            .expect("mock mutex should lock")
            .push(snapshot.clone());
        Ok(())
    }
}
