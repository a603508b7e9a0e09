//! Admin-only routes, guarded by the static admin header rather than a
//! session.

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::middleware::require_admin;
use crate::models::{CreateUser, User};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    email: String,
    name: String,
    password: String,
    #[serde(default)]
    is_admin: bool,
}

/// POST /api/admin/users
///
/// Bootstrap users without open registration. Requires the
/// `X-Admin-Password` header.
async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateUserRequest>,
) -> AppResult<(StatusCode, Json<User>)> {
    require_admin(&state, &headers)?;

    let email = request.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::InvalidPayload("a valid email is required".to_string()));
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

    if request.is_admin {
        sqlx::query("UPDATE users SET is_admin = TRUE WHERE id = $1")
            .bind(user.id)
            .execute(state.db())
            .await?;
    }

    Ok((StatusCode::CREATED, Json(user)))
}

/// Create the admin router.
pub fn router() -> Router<AppState> {
    Router::new().route("/api/admin/users", post(create_user))
}
