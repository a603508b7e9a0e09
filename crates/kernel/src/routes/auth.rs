//! Registration and login.
//!
//! Issues session JWTs, returned in the body and mirrored in the session
//! cookie for browser clients.

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::middleware::{SESSION_COOKIE, issue_token};
use crate::models::{CreateUser, User};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
    name: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    token: String,
    user: User,
}

/// POST /api/auth/register
async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> AppResult<Response> {
    let email = request.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::InvalidPayload("a valid email is required".to_string()));
    }
    if request.password.len() < 8 {
        return Err(AppError::InvalidPayload(
            "password must be at least 8 characters".to_string(),
        ));
    }

    if User::find_by_email(state.db(), &email).await?.is_some() {
        return Err(AppError::NameConflict);
    }

    let user = User::create(
        state.db(),
        CreateUser {
            email,
            name: request.name.trim().to_string(),
            password: request.password,
        },
    )
    .await?;

    let token = issue_token(state.config(), &user)?;
    let headers = session_headers(state.config(), &token)?;

    Ok((StatusCode::CREATED, headers, Json(SessionResponse { token, user })).into_response())
}

/// POST /api/auth/login
async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> AppResult<Response> {
    let email = request.email.trim().to_lowercase();

    let user = User::find_by_email(state.db(), &email)
        .await?
        .filter(|u| u.verify_password(&request.password))
        .ok_or(AppError::Unauthorized)?;

    let token = issue_token(state.config(), &user)?;
    let headers = session_headers(state.config(), &token)?;

    Ok((StatusCode::OK, headers, Json(SessionResponse { token, user })).into_response())
}

fn session_headers(config: &Config, token: &str) -> AppResult<HeaderMap> {
    let mut cookie = format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        config.session_timeout_seconds
    );
    if config.cookie_secure {
        cookie.push_str("; Secure");
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        HeaderValue::from_str(&cookie)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("bad cookie header: {e}")))?,
    );

    Ok(headers)
}

/// Create the auth router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
}
