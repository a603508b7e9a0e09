//! Token authentication middleware.
//!
//! Accepts `Authorization: Bearer <jwt>` or the session cookie. A valid
//! token loads the user and stores it in request extensions; handlers
//! that need a caller use the [`CurrentUser`] extractor. Requests with no
//! credentials pass through anonymously and fail only when a handler
//! demands a user. Presenting an invalid token is always a 401.

use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{Request, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::models::User;
use crate::state::AppState;

/// Session cookie name.
pub const SESSION_COOKIE: &str = "quorum_session";

/// JWT claims carried by session tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Expiry (unix seconds).
    pub exp: i64,
    /// Issued at (unix seconds).
    pub iat: i64,
}

/// Issue a session token for a user.
pub fn issue_token(config: &Config, user: &User) -> anyhow::Result<String> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user.id.to_string(),
        exp: now + config.session_timeout_seconds as i64,
        iat: now,
    };

    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )?;

    Ok(token)
}

/// Verify a session token and return its claims.
pub fn verify_token(secret: &str, token: &str) -> anyhow::Result<Claims> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;

    Ok(data.claims)
}

/// Authenticated user stored in request extensions.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

/// Middleware: resolve the caller from a bearer token or session cookie.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let token = bearer_token(&request).or_else(|| cookie_token(&request));

    let Some(token) = token else {
        return next.run(request).await;
    };

    let claims = match verify_token(&state.config().jwt_secret, &token) {
        Ok(claims) => claims,
        Err(e) => {
            debug!(error = %e, "invalid session token");
            return AppError::Unauthorized.into_response();
        }
    };

    let Ok(user_id) = claims.sub.parse::<Uuid>() else {
        debug!(sub = %claims.sub, "invalid subject in session token");
        return AppError::Unauthorized.into_response();
    };

    let user = match User::find_by_id(state.db(), user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return AppError::Unauthorized.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to load user for token");
            return AppError::Internal(e).into_response();
        }
    };

    request.extensions_mut().insert(AuthUser(user));
    next.run(request).await
}

fn bearer_token(request: &Request<Body>) -> Option<String> {
    request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn cookie_token(request: &Request<Body>) -> Option<String> {
    let cookies = request.headers().get("Cookie")?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// Extractor for handlers that require an authenticated caller.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .map(|auth| CurrentUser(auth.0.clone()))
            .ok_or(AppError::Unauthorized)
    }
}

/// Check the static admin header in constant time.
pub fn require_admin(state: &AppState, headers: &axum::http::HeaderMap) -> Result<(), AppError> {
    let presented = headers
        .get("X-Admin-Password")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let expected = state.config().admin_password.as_bytes();
    if presented.as_bytes().ct_eq(expected).into() {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}
