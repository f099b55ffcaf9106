//! Shared state wiring the generation core, the caller-facing API key, and
//! the admin surface's session store into one `axum` `State`.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::Config;
use crate::generation::GenerationContext;
use crate::request_log::RequestLog;

/// In-memory bearer tokens minted by `POST /api/login`. No expiry sweep: the
/// set is small and process-lifetime, matching the admin surface's "thin"
/// scope (spec §4.7) — an operator restart invalidates every session.
#[derive(Default)]
pub struct AdminSessions {
    tokens: RwLock<HashSet<String>>,
}

impl AdminSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mint(&self) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.tokens.write().await.insert(token.clone());
        token
    }

    pub async fn is_valid(&self, token: &str) -> bool {
        self.tokens.read().await.contains(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn minted_token_is_valid_until_a_different_one_is_checked() {
        let sessions = AdminSessions::new();
        let token = sessions.mint().await;
        assert!(sessions.is_valid(&token).await);
        assert!(!sessions.is_valid("not-a-real-token").await);
    }

    #[tokio::test]
    async fn each_mint_produces_a_distinct_token() {
        let sessions = AdminSessions::new();
        let a = sessions.mint().await;
        let b = sessions.mint().await;
        assert_ne!(a, b);
        assert!(sessions.is_valid(&a).await);
        assert!(sessions.is_valid(&b).await);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub generation: Arc<GenerationContext>,
    pub admin_sessions: Arc<AdminSessions>,
    pub admin_username: Arc<str>,
    pub admin_password: Arc<str>,
    pub api_key: Option<Arc<str>>,
    pub cache_dir: std::path::PathBuf,
    pub request_log: Arc<RequestLog>,
}

impl AppState {
    pub fn new(generation: GenerationContext, request_log: RequestLog, config: &Config) -> Self {
        Self {
            generation: Arc::new(generation),
            admin_sessions: Arc::new(AdminSessions::new()),
            admin_username: config.admin_username.as_str().into(),
            admin_password: config.admin_password.as_str().into(),
            api_key: config.api_key.as_deref().map(Into::into),
            cache_dir: config.cache.dir.clone(),
            request_log: Arc::new(request_log),
        }
    }
}
