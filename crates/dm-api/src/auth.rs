//! Session cookies, API keys and capability checks.
//!
//! API keys look like `dockmon_<base64url(24 bytes)>`; only the first 20
//! characters are stored as a display prefix, and the full key exists in the
//! database only as its SHA-256.

use std::collections::HashMap;
use std::sync::Mutex;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::CookieJar;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use dm_common::DmError;
use dm_store::models::ApiKey;
use ring::digest;

use crate::error::ApiError;
use crate::state::ApiState;

pub const SESSION_COOKIE: &str = "dockmon_session";
const SESSION_TTL_HOURS: i64 = 12;
pub const API_KEY_PREFIX_LEN: usize = 20;

// ── Sessions ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: i64,
    pub username: String,
    pub role: String,
    pub expires_at: DateTime<Utc>,
}

/// In-memory session map; sessions do not survive restarts.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, user_id: i64, username: &str, role: &str) -> String {
        let token = generate_token_material();
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                token.clone(),
                Session {
                    user_id,
                    username: username.to_string(),
                    role: role.to_string(),
                    expires_at: Utc::now() + Duration::hours(SESSION_TTL_HOURS),
                },
            );
        token
    }

    pub fn get(&self, token: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get(token) {
            Some(session) if session.expires_at > Utc::now() => Some(session.clone()),
            Some(_) => {
                sessions.remove(token);
                None
            }
            None => None,
        }
    }

    pub fn remove(&self, token: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token);
    }
}

// ── API keys ────────────────────────────────────────────────────

pub fn generate_api_key() -> String {
    format!("dockmon_{}", generate_token_material())
}

fn generate_token_material() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 24];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn hash_api_key(key: &str) -> String {
    hex::encode(digest::digest(&digest::SHA256, key.as_bytes()))
}

pub fn api_key_prefix(key: &str) -> String {
    key.chars().take(API_KEY_PREFIX_LEN).collect()
}

// ── Request identity ────────────────────────────────────────────

/// Authenticated caller: session user or API key principal.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user_id: i64,
    pub username: String,
    pub role: String,
    pub capabilities: Vec<String>,
    pub via_api_key: Option<String>,
}

impl CurrentUser {
    /// Admins hold every capability; everyone else goes through groups.
    pub fn require(&self, capability: &str) -> Result<(), ApiError> {
        if self.role == "admin" || self.capabilities.iter().any(|c| c == capability) {
            Ok(())
        } else {
            Err(DmError::Forbidden(format!("Missing capability {capability}")).into())
        }
    }
}

impl FromRequestParts<ApiState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        // Bearer API key first
        if let Some(auth) = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            if let Some(key) = auth.strip_prefix("Bearer ") {
                return authenticate_api_key(state, key);
            }
        }

        // Session cookie
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar
            .get(SESSION_COOKIE)
            .map(|c| c.value().to_string())
            .ok_or_else(|| ApiError(DmError::Auth("Not authenticated".into())))?;
        let session = state
            .sessions
            .get(&token)
            .ok_or_else(|| ApiError(DmError::Auth("Session expired".into())))?;

        let capabilities = state.store.user_capabilities(session.user_id)?;
        Ok(CurrentUser {
            user_id: session.user_id,
            username: session.username,
            role: session.role,
            capabilities,
            via_api_key: None,
        })
    }
}

fn authenticate_api_key(state: &ApiState, key: &str) -> Result<CurrentUser, ApiError> {
    if !key.starts_with("dockmon_") {
        return Err(DmError::Auth("Malformed API key".into()).into());
    }
    let key_hash = hash_api_key(key);
    let api_key: ApiKey = state
        .store
        .find_api_key_by_hash(&key_hash)?
        .filter(|k| !k.revoked)
        .ok_or_else(|| ApiError(DmError::Auth("Invalid API key".into())))?;

    let _ = state.store.touch_api_key(&api_key.id);
    let capabilities = state.store.user_capabilities(api_key.user_id)?;
    Ok(CurrentUser {
        user_id: api_key.user_id,
        username: format!("api-key:{}", api_key.name),
        role: "user".into(),
        capabilities,
        via_api_key: Some(api_key.id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_format() {
        let key = generate_api_key();
        assert!(key.starts_with("dockmon_"));
        // 24 bytes of url-safe base64 without padding is 32 chars
        assert_eq!(key.len(), "dockmon_".len() + 32);
    }

    #[test]
    fn test_prefix_and_hash() {
        let key = "dockmon_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let prefix = api_key_prefix(key);
        assert_eq!(prefix.len(), 20);
        assert!(prefix.starts_with("dockmon_"));

        let hash = hash_api_key(key);
        assert_eq!(hash.len(), 64); // hex SHA-256
        assert_eq!(hash, hash_api_key(key));
        assert_ne!(hash, hash_api_key("dockmon_other"));
    }

    #[test]
    fn test_session_expiry() {
        let store = SessionStore::new();
        let token = store.create(1, "admin", "admin");
        assert!(store.get(&token).is_some());
        store.remove(&token);
        assert!(store.get(&token).is_none());
    }
}
