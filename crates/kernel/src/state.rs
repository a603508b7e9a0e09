//! Application state shared across all handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::audit::AuditRecorder;
use crate::catalog;
use crate::changes::{ChangeService, MergeExecutor};
use crate::config::Config;
use crate::notify::Notifier;
use crate::permissions::PermissionService;
use crate::staging::{StagingManager, StorageRouter};
use crate::storage::{RelationalBackend, VersionedBackend};
use crate::validation::VALIDATION_DEADLINE;

/// Shared application state.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Loaded configuration.
    config: Config,

    /// PostgreSQL connection pool (the catalog store).
    db: PgPool,

    /// Permission service for project-scope access control.
    permissions: PermissionService,

    /// Backend router for dataset tables.
    storage: StorageRouter,

    /// Staging manager for per-CR staging areas.
    staging: StagingManager,

    /// Change request orchestrator.
    changes: ChangeService,

    /// Append-only audit recorder.
    audit: AuditRecorder,

    /// Best-effort notifier.
    notifier: Notifier,
}

impl AppState {
    /// Create new application state with database connections.
    pub async fn new(config: &Config) -> Result<Self> {
        let db = catalog::connect(config)
            .await
            .context("failed to open the catalog store")?;

        let versioned = Arc::new(VersionedBackend::new(config.data_root.clone()));
        let relational = Arc::new(RelationalBackend::new(db.clone()));
        let storage = StorageRouter::new(versioned, relational);

        let staging = StagingManager::new(storage.clone());
        let audit = AuditRecorder::new(db.clone(), config.audit_root.clone());
        let notifier = Notifier::new(db.clone());
        let permissions = PermissionService::new(db.clone());

        let merge = MergeExecutor::new(
            db.clone(),
            staging.clone(),
            audit.clone(),
            VALIDATION_DEADLINE,
        );

        let changes = ChangeService::new(
            db.clone(),
            staging.clone(),
            merge,
            notifier.clone(),
            VALIDATION_DEADLINE,
            Duration::from_secs(config.merge_timeout_seconds),
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config: config.clone(),
                db,
                permissions,
                storage,
                staging,
                changes,
                audit,
                notifier,
            }),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool.
    pub fn db(&self) -> &PgPool {
        &self.inner.db
    }

    /// Get the permission service.
    pub fn permissions(&self) -> &PermissionService {
        &self.inner.permissions
    }

    /// Get the storage router.
    pub fn storage(&self) -> &StorageRouter {
        &self.inner.storage
    }

    /// Get the staging manager.
    pub fn staging(&self) -> &StagingManager {
        &self.inner.staging
    }

    /// Get the change request service.
    pub fn changes(&self) -> &ChangeService {
        &self.inner.changes
    }

    /// Get the audit recorder.
    pub fn audit(&self) -> &AuditRecorder {
        &self.inner.audit
    }

    /// Get the notifier.
    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    /// Check if the catalog store answers queries.
    pub async fn catalog_healthy(&self) -> bool {
        catalog::is_reachable(&self.inner.db).await
    }
}
