use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use dm_common::DmError;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::auth::{CurrentUser, SESSION_COOKIE};
use crate::error::ApiResult;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/me", get(me))
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    State(state): State<ApiState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> ApiResult<(CookieJar, Json<Value>)> {
    let user = state
        .store
        .get_user_by_username(&req.username)?
        .filter(|u| u.enabled)
        .ok_or(DmError::Auth("Invalid credentials".into()))?;

    let parsed = PasswordHash::new(&user.password_hash)
        .map_err(|_| DmError::Auth("Invalid credentials".into()))?;
    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed)
        .map_err(|_| DmError::Auth("Invalid credentials".into()))?;

    let token = state.sessions.create(user.id, &user.username, &user.role);
    let cookie = Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(true)
        .build();

    info!(username = user.username, "User logged in");
    let _ = state.store.append_audit(
        &user.username,
        "auth.login",
        "user",
        Some(&user.id.to_string()),
        None,
        None,
        None,
    );

    Ok((
        jar.add(cookie),
        Json(json!({"username": user.username, "role": user.role})),
    ))
}

async fn logout(State(state): State<ApiState>, jar: CookieJar) -> (CookieJar, Json<Value>) {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.sessions.remove(cookie.value());
    }
    (
        jar.remove(Cookie::from(SESSION_COOKIE)),
        Json(json!({"ok": true})),
    )
}

async fn me(user: CurrentUser) -> Json<Value> {
    Json(json!({
        "username": user.username,
        "role": user.role,
        "capabilities": user.capabilities,
    }))
}
