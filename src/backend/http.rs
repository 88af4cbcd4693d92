//! HTTP implementation of the backend collaborator traits.
//!
//! DESIGN
//! ======
//! Thin reqwest wrapper over the product backend's internal API. Response
//! decoding lives in free functions so it can be tested without a live
//! server. All four traits share one client and one base URL.

use reqwest::RequestBuilder;
use uuid::Uuid;

use crate::config::BackendConfig;

use super::types::{BackendError, Question, QuestionFilter, SessionSnapshot, UserProfile};
use super::{QuestionStore, SessionArchive, TokenVerifier, UserDirectory};

const CONNECT_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// CLIENT
// =============================================================================

pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpBackend {
    /// Build the backend client from a parsed config.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the underlying HTTP client cannot be
    /// constructed.
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| BackendError::Request(e.to_string()))?;
        Ok(Self { http, base_url: config.base_url, api_token: config.api_token })
    }

    /// Build the backend client from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unconfigured`] when `BACKEND_BASE_URL` is
    /// unset.
    pub fn from_env() -> Result<Self, BackendError> {
        let config = BackendConfig::from_env().ok_or(BackendError::Unconfigured)?;
        Self::new(config)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_text(&self, path: &str) -> Result<(u16, String), BackendError> {
        let response = self
            .authed(self.http.get(self.url(path)))
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        Ok((status, text))
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(serde::Serialize)]
struct VerifyRequest<'a> {
    token: &'a str,
}

#[derive(serde::Deserialize)]
struct VerifyResponse {
    user_id: Option<Uuid>,
}

#[derive(serde::Deserialize)]
struct QuestionsResponse {
    questions: Vec<Question>,
}

// =============================================================================
// PARSING
// =============================================================================

fn parse_profile(status: u16, body: &str) -> Result<Option<UserProfile>, BackendError> {
    match status {
        200 => serde_json::from_str(body)
            .map(Some)
            .map_err(|e| BackendError::Decode(e.to_string())),
        404 => Ok(None),
        _ => Err(BackendError::Status { status, body: body.to_string() }),
    }
}

fn parse_questions(status: u16, body: &str) -> Result<Vec<Question>, BackendError> {
    if status != 200 {
        return Err(BackendError::Status { status, body: body.to_string() });
    }
    let decoded: QuestionsResponse = serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))?;
    Ok(decoded.questions)
}

// =============================================================================
// TRAIT IMPLS
// =============================================================================

#[async_trait::async_trait]
impl TokenVerifier for HttpBackend {
    async fn verify(&self, token: &str) -> Result<Option<Uuid>, BackendError> {
        let response = self
            .authed(self.http.post(self.url("/internal/auth/verify")))
            .json(&VerifyRequest { token })
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        // The backend reports an invalid token as 200 + null user_id or 401.
        if status == 401 {
            return Ok(None);
        }
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        if status != 200 {
            return Err(BackendError::Status { status, body: text });
        }
        let decoded: VerifyResponse = serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(decoded.user_id)
    }
}

#[async_trait::async_trait]
impl UserDirectory for HttpBackend {
    async fn profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, BackendError> {
        let (status, body) = self.get_text(&format!("/internal/users/{user_id}/profile")).await?;
        parse_profile(status, &body)
    }
}

#[async_trait::async_trait]
impl QuestionStore for HttpBackend {
    async fn find_questions(&self, filter: &QuestionFilter, desired: usize) -> Result<Vec<Question>, BackendError> {
        let mut path = format!("/internal/questions?limit={desired}");
        if let Some(category) = &filter.category {
            path.push_str(&format!("&category={category}"));
        }
        if let Some(difficulty) = &filter.difficulty {
            path.push_str(&format!("&difficulty={difficulty}"));
        }
        let (status, body) = self.get_text(&path).await?;
        parse_questions(status, &body)
    }
}

#[async_trait::async_trait]
impl SessionArchive for HttpBackend {
    async fn persist_completed(&self, snapshot: &SessionSnapshot) -> Result<(), BackendError> {
        let response = self
            .authed(self.http.post(self.url("/internal/study-sessions")))
            .json(snapshot)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_profile_hit_miss_and_failure() {
        let profile = parse_profile(200, r#"{"display_name": "Sgt. Reyes", "branch": "ARMY"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(profile.display_name, "Sgt. Reyes");
        assert_eq!(profile.branch, "ARMY");

        assert!(parse_profile(404, "").unwrap().is_none());
        assert!(matches!(
            parse_profile(500, "boom"),
            Err(BackendError::Status { status: 500, .. })
        ));
    }

    #[test]
    fn parse_questions_decodes_list() {
        let body = r#"{"questions": [{
            "id": "7f0c0e9e-bb4b-4b7e-9b0a-0e9f2d4c1a11",
            "content": "Select the synonym of rapid.",
            "options": ["slow", "quick", "late"],
            "correct_answer": "quick",
            "explanation": "Rapid means fast.",
            "category": "word_knowledge",
            "difficulty": "easy"
        }]}"#;
        let questions = parse_questions(200, body).unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].correct_answer, "quick");
        assert_eq!(questions[0].category.as_deref(), Some("word_knowledge"));
    }

    #[test]
    fn parse_questions_rejects_bad_body() {
        assert!(matches!(parse_questions(200, "not json"), Err(BackendError::Decode(_))));
        assert!(matches!(
            parse_questions(502, ""),
            Err(BackendError::Status { status: 502, .. })
        ));
    }

    #[test]
    fn url_joins_without_double_slash() {
        let backend = HttpBackend::new(crate::config::BackendConfig {
            base_url: "https://api.example.com/".into(),
            api_token: None,
            timeout: std::time::Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(backend.url("/internal/questions"), "https://api.example.com/internal/questions");
    }
}
