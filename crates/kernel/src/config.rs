//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// Which storage backend newly created datasets use by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultBackend {
    Versioned,
    Relational,
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 3000).
    pub port: u16,

    /// Secret used to sign session JWTs. Must be at least 32 characters.
    pub jwt_secret: String,

    /// Static password for admin-only endpoints. At least 12 characters
    /// with upper case, lower case, and a digit.
    pub admin_password: String,

    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Maximum database connections in pool (default: 10).
    pub database_max_connections: u32,

    /// Root directory for versioned dataset tables (default: ./data).
    pub data_root: PathBuf,

    /// Root directory for audit artifacts (default: ./audit).
    pub audit_root: PathBuf,

    /// Backend assigned to datasets that do not request one.
    pub default_storage_backend: DefaultBackend,

    /// Session JWT lifetime in seconds (default: 86400).
    pub session_timeout_seconds: u64,

    /// Whether the session cookie is marked Secure (default: true in
    /// production).
    pub cookie_secure: bool,

    /// Deployment environment (default: development).
    pub environment: Environment,

    /// Disable the background sweeper (default: false).
    pub disable_worker: bool,

    /// Outer deadline for merge operations in seconds (default: 60).
    pub merge_timeout_seconds: u64,

    /// Per-request deadline in seconds (default: 30).
    pub request_timeout_seconds: u64,

    /// CORS allowed origins (comma-separated, default: "*").
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("PORT must be a valid u16")?;

        let jwt_secret =
            env::var("JWT_SECRET").context("JWT_SECRET environment variable is required")?;
        validate_jwt_secret(&jwt_secret)?;

        let admin_password = env::var("ADMIN_PASSWORD")
            .context("ADMIN_PASSWORD environment variable is required")?;
        validate_admin_password(&admin_password)?;

        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be a valid u32")?;

        let data_root = env::var("DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let audit_root = env::var("AUDIT_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./audit"));

        let default_storage_backend = match env::var("DEFAULT_STORAGE_BACKEND")
            .unwrap_or_else(|_| "versioned".to_string())
            .to_lowercase()
            .as_str()
        {
            "versioned" => DefaultBackend::Versioned,
            "relational" => DefaultBackend::Relational,
            other => bail!("DEFAULT_STORAGE_BACKEND must be 'versioned' or 'relational', got '{other}'"),
        };

        let session_timeout_seconds = env::var("SESSION_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse()
            .context("SESSION_TIMEOUT_SECONDS must be a valid u64")?;

        let environment = match env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
            .as_str()
        {
            "production" => Environment::Production,
            _ => Environment::Development,
        };

        let cookie_secure = match env::var("COOKIE_SECURE") {
            Ok(v) => v == "true" || v == "1",
            Err(_) => environment == Environment::Production,
        };

        let disable_worker = env::var("DISABLE_WORKER")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let merge_timeout_seconds = env::var("MERGE_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .context("MERGE_TIMEOUT_SECONDS must be a valid u64")?;

        let request_timeout_seconds = env::var("REQUEST_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("REQUEST_TIMEOUT_SECONDS must be a valid u64")?;

        let cors_allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|_| vec!["*".to_string()]);

        Ok(Self {
            port,
            jwt_secret,
            admin_password,
            database_url,
            database_max_connections,
            data_root,
            audit_root,
            default_storage_backend,
            session_timeout_seconds,
            cookie_secure,
            environment,
            disable_worker,
            merge_timeout_seconds,
            request_timeout_seconds,
            cors_allowed_origins,
        })
    }
}

fn validate_jwt_secret(secret: &str) -> Result<()> {
    if secret.len() < 32 {
        bail!("JWT_SECRET must be at least 32 characters");
    }
    Ok(())
}

fn validate_admin_password(password: &str) -> Result<()> {
    if password.len() < 12 {
        bail!("ADMIN_PASSWORD must be at least 12 characters");
    }
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_upper && has_lower && has_digit) {
        bail!("ADMIN_PASSWORD must contain upper case, lower case, and a digit");
    }
    Ok(())
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn jwt_secret_length_enforced() {
        assert!(validate_jwt_secret("short").is_err());
        assert!(validate_jwt_secret(&"x".repeat(32)).is_ok());
        assert!(validate_jwt_secret(&"x".repeat(31)).is_err());
    }

    #[test]
    fn admin_password_complexity_enforced() {
        assert!(validate_admin_password("Short1").is_err());
        assert!(validate_admin_password("alllowercase1234").is_err());
        assert!(validate_admin_password("ALLUPPERCASE1234").is_err());
        assert!(validate_admin_password("NoDigitsHereAtAll").is_err());
        assert!(validate_admin_password("Sufficient1234").is_ok());
    }
}
