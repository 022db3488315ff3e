//! SQLite persistence for organizations and creator users.

use sqlx::Row;
use sqlx::SqlitePool;
use tracing::warn;

use super::{
    CreatorUser, OrgConfig, OrgError, Organization, UserConfig, UserType, SYSTEM_ORG_SLUG,
};

/// Store for organization and creator-user rows.
#[derive(Debug, Clone)]
pub struct OrgStore {
    pool: SqlitePool,
}

impl OrgStore {
    /// Wrap a pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // -- organizations ------------------------------------------------------

    /// Fetch an organization by row id.
    ///
    /// # Errors
    ///
    /// Returns [`OrgError::NotFound`] if no row matches.
    pub async fn organization_by_id(&self, id: i64) -> Result<Organization, OrgError> {
        let row = sqlx::query(
            "SELECT id, slug, name, status, is_system, config FROM organizations WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_organization).ok_or(OrgError::NotFound {
            entity: "organization",
        })
    }

    /// Fetch an organization by slug.
    ///
    /// # Errors
    ///
    /// Returns [`OrgError::NotFound`] if no row matches.
    pub async fn organization_by_slug(&self, slug: &str) -> Result<Organization, OrgError> {
        let row = sqlx::query(
            "SELECT id, slug, name, status, is_system, config FROM organizations WHERE slug = ?1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_organization).ok_or(OrgError::NotFound {
            entity: "organization",
        })
    }

    /// Create an organization and return its id.
    ///
    /// # Errors
    ///
    /// Returns a database error on conflict or failure.
    pub async fn create_organization(
        &self,
        slug: &str,
        name: &str,
        config: &OrgConfig,
    ) -> Result<i64, OrgError> {
        let config_json =
            serde_json::to_string(config).map_err(|e| OrgError::InvalidConfig(e.to_string()))?;
        let is_system = slug == SYSTEM_ORG_SLUG;

        let result = sqlx::query(
            "INSERT INTO organizations (slug, name, is_system, config) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(slug)
        .bind(name)
        .bind(is_system)
        .bind(config_json)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Replace an organization's configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`OrgError::NotFound`] if the organization does not exist.
    pub async fn update_organization_config(
        &self,
        id: i64,
        config: &OrgConfig,
    ) -> Result<(), OrgError> {
        let config_json =
            serde_json::to_string(config).map_err(|e| OrgError::InvalidConfig(e.to_string()))?;

        let result = sqlx::query("UPDATE organizations SET config = ?1 WHERE id = ?2")
            .bind(config_json)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrgError::NotFound {
                entity: "organization",
            });
        }
        Ok(())
    }

    /// Delete an organization. The system organization is protected.
    ///
    /// # Errors
    ///
    /// Returns [`OrgError::SystemOrgProtected`] for the system row and
    /// [`OrgError::NotFound`] if the organization does not exist.
    pub async fn delete_organization(&self, id: i64) -> Result<(), OrgError> {
        let org = self.organization_by_id(id).await?;
        if org.is_system {
            return Err(OrgError::SystemOrgProtected);
        }

        sqlx::query("DELETE FROM organizations WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- creator users ------------------------------------------------------

    /// Fetch a creator user by email.
    ///
    /// # Errors
    ///
    /// Returns [`OrgError::NotFound`] if no row matches.
    pub async fn user_by_email(&self, email: &str) -> Result<CreatorUser, OrgError> {
        let row = sqlx::query(
            "SELECT id, email, name, organization_id, user_type, enabled, is_admin, user_config \
             FROM creator_users WHERE email = ?1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_user)
            .ok_or(OrgError::NotFound { entity: "user" })
    }

    /// Fetch a creator user by id.
    ///
    /// # Errors
    ///
    /// Returns [`OrgError::NotFound`] if no row matches.
    pub async fn user_by_id(&self, id: i64) -> Result<CreatorUser, OrgError> {
        let row = sqlx::query(
            "SELECT id, email, name, organization_id, user_type, enabled, is_admin, user_config \
             FROM creator_users WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_user)
            .ok_or(OrgError::NotFound { entity: "user" })
    }

    /// List users belonging to an organization, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn users_in_organization(&self, org_id: i64) -> Result<Vec<CreatorUser>, OrgError> {
        let rows = sqlx::query(
            "SELECT id, email, name, organization_id, user_type, enabled, is_admin, user_config \
             FROM creator_users WHERE organization_id = ?1 ORDER BY name COLLATE NOCASE",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_user).collect())
    }

    /// Create a creator user and return its id.
    ///
    /// # Errors
    ///
    /// Returns a database error on conflict or failure.
    pub async fn create_user(
        &self,
        email: &str,
        name: &str,
        organization_id: i64,
        user_type: UserType,
    ) -> Result<i64, OrgError> {
        let result = sqlx::query(
            "INSERT INTO creator_users (email, name, organization_id, user_type) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(email)
        .bind(name)
        .bind(organization_id)
        .bind(user_type.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Replace a user's settings document.
    ///
    /// # Errors
    ///
    /// Returns [`OrgError::NotFound`] if the user does not exist.
    pub async fn update_user_config(&self, id: i64, config: &UserConfig) -> Result<(), OrgError> {
        let config_json =
            serde_json::to_string(config).map_err(|e| OrgError::InvalidConfig(e.to_string()))?;

        let result = sqlx::query("UPDATE creator_users SET user_config = ?1 WHERE id = ?2")
            .bind(config_json)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrgError::NotFound { entity: "user" });
        }
        Ok(())
    }

    /// Resolve the organization owning a creator user identified by email.
    ///
    /// # Errors
    ///
    /// Returns [`OrgError::NotFound`] if the user or organization is missing.
    pub async fn organization_for_owner(&self, email: &str) -> Result<Organization, OrgError> {
        let user = self.user_by_email(email).await?;
        self.organization_by_id(user.organization_id).await
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_organization(row: sqlx::sqlite::SqliteRow) -> Organization {
    let config_raw: String = row.get("config");
    let config = serde_json::from_str(&config_raw).unwrap_or_else(|e| {
        warn!(error = %e, "unparseable organization config, using defaults");
        OrgConfig::default()
    });

    Organization {
        id: row.get("id"),
        slug: row.get("slug"),
        name: row.get("name"),
        status: row.get("status"),
        is_system: row.get("is_system"),
        config,
    }
}

fn row_to_user(row: sqlx::sqlite::SqliteRow) -> CreatorUser {
    let config_raw: String = row.get("user_config");
    let user_config = serde_json::from_str(&config_raw).unwrap_or_else(|e| {
        warn!(error = %e, "unparseable user config, using defaults");
        UserConfig::default()
    });
    let user_type: String = row.get("user_type");

    CreatorUser {
        id: row.get("id"),
        email: row.get("email"),
        name: row.get("name"),
        organization_id: row.get("organization_id"),
        user_type: UserType::parse(&user_type),
        enabled: row.get("enabled"),
        is_admin: row.get("is_admin"),
        user_config,
    }
}
