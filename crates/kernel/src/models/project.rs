//! Project and membership models.
//!
//! Every dataset and change request lives inside a project. Membership
//! carries exactly one role per user; each project has exactly one owner.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::ids;

/// Project-scoped role, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectRole {
    Viewer,
    Contributor,
    Owner,
}

impl ProjectRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectRole::Viewer => "viewer",
            ProjectRole::Contributor => "contributor",
            ProjectRole::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "viewer" => Some(ProjectRole::Viewer),
            "contributor" => Some(ProjectRole::Contributor),
            "owner" => Some(ProjectRole::Owner),
            _ => None,
        }
    }

    /// Whether this role grants at least the privileges of `min`.
    pub fn at_least(self, min: ProjectRole) -> bool {
        self >= min
    }
}

/// Project record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: Uuid,
    pub public_id: String,
    pub owner_user_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Membership row joined with the member's email for display.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MemberInfo {
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
}

impl Project {
    /// Create a project owned by `owner`. Inserts the owner membership in
    /// the same transaction.
    pub async fn create(pool: &PgPool, name: &str, owner: Uuid) -> Result<Self> {
        let id = Uuid::now_v7();
        let public_id = ids::public_id();

        let mut tx = pool.begin().await.context("failed to begin transaction")?;

        let project = sqlx::query_as::<_, Project>(
            r#"
            INSERT INTO projects (id, public_id, owner_user_id, name)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&public_id)
        .bind(owner)
        .bind(name)
        .fetch_one(&mut *tx)
        .await
        .context("failed to create project")?;

        sqlx::query(
            "INSERT INTO project_members (project_id, user_id, role) VALUES ($1, $2, 'owner')",
        )
        .bind(id)
        .bind(owner)
        .execute(&mut *tx)
        .await
        .context("failed to insert owner membership")?;

        tx.commit().await.context("failed to commit project")?;

        Ok(project)
    }

    /// Find a project by ID.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>> {
        let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch project by id")?;

        Ok(project)
    }

    /// Resolve a project from an external key (UUID or public id).
    pub async fn resolve(pool: &PgPool, key: &str) -> Result<Option<Self>> {
        if let Some(id) = ids::as_uuid(key) {
            return Self::find_by_id(pool, id).await;
        }

        let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE public_id = $1")
            .bind(key)
            .fetch_optional(pool)
            .await
            .context("failed to fetch project by public id")?;

        Ok(project)
    }

    /// List projects the given user is a member of.
    pub async fn list_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Self>> {
        let projects = sqlx::query_as::<_, Project>(
            r#"
            SELECT p.* FROM projects p
            JOIN project_members pm ON p.id = pm.project_id
            WHERE pm.user_id = $1
            ORDER BY p.name
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
        .context("failed to list projects for user")?;

        Ok(projects)
    }

    /// Whether another project already uses this name.
    pub async fn name_taken(pool: &PgPool, name: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects WHERE name = $1")
            .bind(name)
            .fetch_one(pool)
            .await
            .context("failed to check project name")?;

        Ok(count > 0)
    }

    /// Delete a project. Cascades to datasets and change requests.
    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .context("failed to delete project")?;

        Ok(result.rows_affected() > 0)
    }

    /// Role of `user_id` in this project, if any.
    pub async fn role_of(pool: &PgPool, project_id: Uuid, user_id: Uuid) -> Result<Option<ProjectRole>> {
        let role: Option<String> = sqlx::query_scalar(
            "SELECT role FROM project_members WHERE project_id = $1 AND user_id = $2",
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch member role")?;

        Ok(role.as_deref().and_then(ProjectRole::parse))
    }

    /// All member user ids for this project.
    pub async fn member_ids(pool: &PgPool, project_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT user_id FROM project_members WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_all(pool)
        .await
        .context("failed to list member ids")?;

        Ok(ids)
    }

    /// Members joined with account details.
    pub async fn members(pool: &PgPool, project_id: Uuid) -> Result<Vec<MemberInfo>> {
        let members = sqlx::query_as::<_, MemberInfo>(
            r#"
            SELECT pm.user_id, u.email, u.name, pm.role
            FROM project_members pm
            JOIN users u ON u.id = pm.user_id
            WHERE pm.project_id = $1
            ORDER BY u.email
            "#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await
        .context("failed to list project members")?;

        Ok(members)
    }

    /// Add a member or change an existing member's role.
    pub async fn upsert_member(
        pool: &PgPool,
        project_id: Uuid,
        user_id: Uuid,
        role: ProjectRole,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO project_members (project_id, user_id, role)
            VALUES ($1, $2, $3)
            ON CONFLICT (project_id, user_id) DO UPDATE SET role = EXCLUDED.role
            "#,
        )
        .bind(project_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(pool)
        .await
        .context("failed to upsert project member")?;

        Ok(())
    }

    /// Remove a member. The owner membership is never removed here; the
    /// caller enforces the owner-presence rule before calling.
    pub async fn remove_member(pool: &PgPool, project_id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM project_members WHERE project_id = $1 AND user_id = $2 AND role <> 'owner'",
        )
        .bind(project_id)
        .bind(user_id)
        .execute(pool)
        .await
        .context("failed to remove project member")?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering() {
        assert!(ProjectRole::Owner.at_least(ProjectRole::Contributor));
        assert!(ProjectRole::Contributor.at_least(ProjectRole::Contributor));
        assert!(!ProjectRole::Viewer.at_least(ProjectRole::Contributor));
        assert!(ProjectRole::Owner.at_least(ProjectRole::Viewer));
    }

    #[test]
    fn role_round_trip() {
        for role in [ProjectRole::Viewer, ProjectRole::Contributor, ProjectRole::Owner] {
            assert_eq!(ProjectRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(ProjectRole::parse("admin"), None);
    }
}
