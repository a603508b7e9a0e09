//! Catalog store connection.
//!
//! The catalog is the PostgreSQL database holding projects, datasets,
//! change requests, and the append-only audit trail. Connecting always
//! brings the schema up to date: the embedded migrations are applied
//! before the pool is handed out, so no caller ever sees a partially
//! initialized catalog.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::Config;

static MIGRATIONS: Migrator = sqlx::migrate!("./migrations");

/// Connect to the catalog and apply pending migrations.
pub async fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("failed to connect to the catalog database")?;

    MIGRATIONS
        .run(&pool)
        .await
        .context("failed to apply catalog migrations")?;

    Ok(pool)
}

/// Whether the catalog currently answers queries.
pub async fn is_reachable(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
