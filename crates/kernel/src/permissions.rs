//! Project-scope permission checks with DashMap-based caching.

use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Project, ProjectRole, User};

/// Permission service with fast lookups of (project, user) roles.
#[derive(Clone)]
pub struct PermissionService {
    inner: Arc<PermissionServiceInner>,
}

struct PermissionServiceInner {
    /// Cache of (project_id, user_id) -> role.
    role_cache: DashMap<(Uuid, Uuid), Option<ProjectRole>>,

    /// Database pool for cache misses.
    pool: PgPool,
}

impl PermissionService {
    /// Create a new permission service.
    pub fn new(pool: PgPool) -> Self {
        Self {
            inner: Arc::new(PermissionServiceInner {
                role_cache: DashMap::new(),
                pool,
            }),
        }
    }

    /// The user's role in a project, if they are a member.
    ///
    /// Platform admins act as project owners everywhere.
    pub async fn role(&self, project_id: Uuid, user: &User) -> Result<Option<ProjectRole>> {
        if user.is_admin {
            return Ok(Some(ProjectRole::Owner));
        }

        let cache_key = (project_id, user.id);
        if let Some(cached) = self.inner.role_cache.get(&cache_key) {
            return Ok(*cached);
        }

        let role = Project::role_of(&self.inner.pool, project_id, user.id).await?;
        self.inner.role_cache.insert(cache_key, role);

        Ok(role)
    }

    /// Require at least `min` in the project; `Forbidden` otherwise, and
    /// `NotFound` when the user is not a member at all (membership is not
    /// disclosed to outsiders).
    pub async fn require(
        &self,
        project_id: Uuid,
        user: &User,
        min: ProjectRole,
    ) -> AppResult<ProjectRole> {
        let role = self
            .role(project_id, user)
            .await
            .map_err(AppError::Internal)?;

        match role {
            None => Err(AppError::NotFound),
            Some(role) if role.at_least(min) => Ok(role),
            Some(_) => Err(AppError::Forbidden),
        }
    }

    /// Invalidate the cached role for one member.
    ///
    /// Call this when a membership changes.
    pub fn invalidate(&self, project_id: Uuid, user_id: Uuid) {
        self.inner.role_cache.remove(&(project_id, user_id));
    }

    /// Invalidate every cached role for a project.
    pub fn invalidate_project(&self, project_id: Uuid) {
        self.inner
            .role_cache
            .retain(|(p, _), _| *p != project_id);
    }

    /// Number of cached entries (for monitoring).
    pub fn cache_size(&self) -> usize {
        self.inner.role_cache.len()
    }
}
