//! Request middleware.

mod auth;

pub use auth::{
    AuthUser, Claims, CurrentUser, SESSION_COOKIE, authenticate, issue_token, require_admin,
    verify_token,
};
