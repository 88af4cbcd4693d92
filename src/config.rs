//! Runtime configuration loaded from environment variables.
//!
//! DESIGN
//! ======
//! Everything has a default so the service boots in development with only
//! `BACKEND_BASE_URL` set. Parsing failures fall back to defaults rather
//! than aborting startup.

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_RESULTS_DISPLAY_MS: u64 = 3000;
const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 5000;

/// Parse an environment variable, falling back to `default` when unset or
/// malformed.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Gateway tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    /// TCP port for the HTTP/WS listener.
    pub port: u16,
    /// How long question results stay on screen before the next question
    /// is emitted, in milliseconds.
    pub results_display_ms: u64,
    /// When true and a room has a per-question time limit, a server timer
    /// forces question completion once the limit elapses, scoring
    /// unanswered active participants as incorrect.
    pub question_timeout_enforced: bool,
}

impl GatewayConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            results_display_ms: env_parse("RESULTS_DISPLAY_MS", DEFAULT_RESULTS_DISPLAY_MS),
            question_timeout_enforced: env_parse("QUESTION_TIMEOUT_ENFORCED", false),
        }
    }

    #[must_use]
    pub fn results_display_delay(&self) -> Duration {
        Duration::from_millis(self.results_display_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            results_display_ms: DEFAULT_RESULTS_DISPLAY_MS,
            question_timeout_enforced: false,
        }
    }
}

/// Connection settings for the product backend (question store, user
/// directory, token verification, session archive).
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of the backend API, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Bearer token for service-to-service calls.
    pub api_token: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl BackendConfig {
    /// Read backend settings from the environment.
    ///
    /// Returns `None` when `BACKEND_BASE_URL` is unset; callers decide
    /// whether that is fatal (it is for the live binary, not for tests).
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("BACKEND_BASE_URL").ok()?;
        Some(Self {
            base_url,
            api_token: std::env::var("BACKEND_API_TOKEN").ok(),
            timeout: Duration::from_millis(env_parse("BACKEND_TIMEOUT_MS", DEFAULT_BACKEND_TIMEOUT_MS)),
        })
    }
}
