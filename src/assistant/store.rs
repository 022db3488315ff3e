//! SQLite persistence for assistants, publications, and shares.

use chrono::Utc;
use sqlx::Row;
use sqlx::SqlitePool;

use super::{
    validate_name, Assistant, AssistantError, AssistantMetadata, Publication, DELETED_OWNER,
};

/// Fields accepted when creating or updating an assistant.
#[derive(Debug, Clone)]
pub struct AssistantDraft {
    /// Name (validated against the naming rule).
    pub name: String,
    /// Owner email.
    pub owner: String,
    /// Human description.
    pub description: String,
    /// System prompt.
    pub system_prompt: String,
    /// Prompt template.
    pub prompt_template: String,
    /// Metadata document (serialized on write).
    pub metadata: AssistantMetadata,
}

/// One share row joined with user identity.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ShareView {
    /// Shared-with user id.
    pub user_id: i64,
    /// Shared-with user name.
    pub user_name: String,
    /// Shared-with user email.
    pub user_email: String,
    /// When the share was created (RFC 3339).
    pub shared_at: String,
    /// Who created the share.
    pub shared_by_name: String,
}

/// Store for assistant rows.
#[derive(Debug, Clone)]
pub struct AssistantStore {
    pool: SqlitePool,
}

impl AssistantStore {
    /// Wrap a pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // -- reads --------------------------------------------------------------

    /// Fetch an assistant by id, including publication state.
    ///
    /// Soft-deleted rows are reported as [`AssistantError::NotFound`].
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::NotFound`] or a database error.
    pub async fn by_id(&self, id: i64) -> Result<Assistant, AssistantError> {
        let assistant = self.by_id_raw(id).await?;
        if assistant.is_deleted() {
            return Err(AssistantError::NotFound);
        }
        Ok(assistant)
    }

    /// Fetch an assistant by id without the soft-delete filter.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::NotFound`] or a database error.
    pub async fn by_id_raw(&self, id: i64) -> Result<Assistant, AssistantError> {
        let row = sqlx::query(
            "SELECT a.id, a.name, a.owner, a.description, a.system_prompt, a.prompt_template, \
                    a.metadata, p.group_id, p.group_name, p.oauth_consumer_name \
             FROM assistants a \
             LEFT JOIN assistant_publications p ON p.assistant_id = a.id \
             WHERE a.id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_assistant).ok_or(AssistantError::NotFound)
    }

    /// Fetch an assistant by `(name, owner)`.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::NotFound`] or a database error.
    pub async fn by_name(&self, name: &str, owner: &str) -> Result<Assistant, AssistantError> {
        let row = sqlx::query(
            "SELECT a.id, a.name, a.owner, a.description, a.system_prompt, a.prompt_template, \
                    a.metadata, p.group_id, p.group_name, p.oauth_consumer_name \
             FROM assistants a \
             LEFT JOIN assistant_publications p ON p.assistant_id = a.id \
             WHERE a.name = ?1 AND a.owner = ?2",
        )
        .bind(name)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_assistant).ok_or(AssistantError::NotFound)
    }

    /// Paginated listing for one owner, newest first, with the total count.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn list_by_owner(
        &self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Assistant>, i64), AssistantError> {
        let rows = sqlx::query(
            "SELECT a.id, a.name, a.owner, a.description, a.system_prompt, a.prompt_template, \
                    a.metadata, p.group_id, p.group_name, p.oauth_consumer_name \
             FROM assistants a \
             LEFT JOIN assistant_publications p ON p.assistant_id = a.id \
             WHERE a.owner = ?1 ORDER BY a.id DESC LIMIT ?2 OFFSET ?3",
        )
        .bind(owner)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assistants WHERE owner = ?1")
            .bind(owner)
            .fetch_one(&self.pool)
            .await?;

        Ok((rows.into_iter().map(row_to_assistant).collect(), total))
    }

    /// All published, non-deleted assistants.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn list_published(&self) -> Result<Vec<Assistant>, AssistantError> {
        let rows = sqlx::query(
            "SELECT a.id, a.name, a.owner, a.description, a.system_prompt, a.prompt_template, \
                    a.metadata, p.group_id, p.group_name, p.oauth_consumer_name \
             FROM assistants a \
             JOIN assistant_publications p ON p.assistant_id = a.id \
             WHERE a.owner != ?1 ORDER BY a.id",
        )
        .bind(DELETED_OWNER)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_assistant).collect())
    }

    // -- writes -------------------------------------------------------------

    /// Create an assistant and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::InvalidName`] when the name violates the
    /// rule or is taken for this owner.
    pub async fn create(&self, draft: &AssistantDraft) -> Result<i64, AssistantError> {
        validate_name(&draft.name)?;

        let metadata =
            serde_json::to_string(&draft.metadata).unwrap_or_else(|_| "{}".to_owned());
        let result = sqlx::query(
            "INSERT INTO assistants (name, owner, description, system_prompt, prompt_template, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&draft.name)
        .bind(&draft.owner)
        .bind(&draft.description)
        .bind(&draft.system_prompt)
        .bind(&draft.prompt_template)
        .bind(metadata)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                AssistantError::InvalidName(format!("name '{}' is already in use", draft.name)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Update an assistant's editable fields.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::NotFound`] when the row does not exist.
    pub async fn update(&self, id: i64, draft: &AssistantDraft) -> Result<(), AssistantError> {
        validate_name(&draft.name)?;

        let metadata =
            serde_json::to_string(&draft.metadata).unwrap_or_else(|_| "{}".to_owned());
        let result = sqlx::query(
            "UPDATE assistants SET name = ?1, owner = ?2, description = ?3, system_prompt = ?4, \
             prompt_template = ?5, metadata = ?6, updated_at = datetime('now') WHERE id = ?7",
        )
        .bind(&draft.name)
        .bind(&draft.owner)
        .bind(&draft.description)
        .bind(&draft.system_prompt)
        .bind(&draft.prompt_template)
        .bind(metadata)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AssistantError::NotFound);
        }
        Ok(())
    }

    /// Soft-delete: rename to `<name>_deleted_<unix_ts>` and reassign the
    /// owner to the sentinel. The rename keeps the `(name, owner)` key free
    /// for reuse; the sentinel owner hides the row from every listing.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::NotFound`] when the row does not exist.
    pub async fn soft_delete(&self, id: i64) -> Result<(), AssistantError> {
        let assistant = self.by_id(id).await?;
        let deleted_name = format!("{}_deleted_{}", assistant.name, Utc::now().timestamp());

        sqlx::query(
            "UPDATE assistants SET name = ?1, owner = ?2, updated_at = datetime('now') \
             WHERE id = ?3",
        )
        .bind(deleted_name)
        .bind(DELETED_OWNER)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Hard-delete the row; shares and publication cascade.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::NotFound`] when the row does not exist or
    /// belongs to another owner.
    pub async fn hard_delete(&self, id: i64, owner: &str) -> Result<(), AssistantError> {
        let result = sqlx::query("DELETE FROM assistants WHERE id = ?1 AND owner = ?2")
            .bind(id)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AssistantError::NotFound);
        }
        Ok(())
    }

    // -- publication --------------------------------------------------------

    /// Publish (or republish) an assistant to an external group.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn publish(&self, id: i64, publication: &Publication) -> Result<(), AssistantError> {
        sqlx::query(
            "INSERT INTO assistant_publications (assistant_id, group_id, group_name, oauth_consumer_name) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(assistant_id) DO UPDATE SET \
               group_id = excluded.group_id, \
               group_name = excluded.group_name, \
               oauth_consumer_name = excluded.oauth_consumer_name",
        )
        .bind(id)
        .bind(&publication.group_id)
        .bind(&publication.group_name)
        .bind(&publication.oauth_consumer_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove the publication record.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn unpublish(&self, id: i64) -> Result<(), AssistantError> {
        sqlx::query("DELETE FROM assistant_publications WHERE assistant_id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- shares -------------------------------------------------------------

    /// User ids an assistant is currently shared with.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn share_user_ids(&self, assistant_id: i64) -> Result<Vec<i64>, AssistantError> {
        let rows = sqlx::query_scalar(
            "SELECT shared_with_user_id FROM assistant_shares WHERE assistant_id = ?1",
        )
        .bind(assistant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Share rows joined with user identity, sorted by user name.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn shares(&self, assistant_id: i64) -> Result<Vec<ShareView>, AssistantError> {
        let rows = sqlx::query(
            "SELECT s.shared_with_user_id AS user_id, u.name AS user_name, \
                    u.email AS user_email, s.shared_at, b.name AS shared_by_name \
             FROM assistant_shares s \
             JOIN creator_users u ON u.id = s.shared_with_user_id \
             JOIN creator_users b ON b.id = s.shared_by_user_id \
             WHERE s.assistant_id = ?1 ORDER BY u.name COLLATE NOCASE",
        )
        .bind(assistant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ShareView {
                user_id: row.get("user_id"),
                user_name: row.get("user_name"),
                user_email: row.get("user_email"),
                shared_at: row.get("shared_at"),
                shared_by_name: row.get("shared_by_name"),
            })
            .collect())
    }

    /// Insert one share; duplicates are ignored.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn add_share(
        &self,
        assistant_id: i64,
        user_id: i64,
        shared_by: i64,
    ) -> Result<(), AssistantError> {
        sqlx::query(
            "INSERT OR IGNORE INTO assistant_shares \
             (assistant_id, shared_with_user_id, shared_by_user_id) VALUES (?1, ?2, ?3)",
        )
        .bind(assistant_id)
        .bind(user_id)
        .bind(shared_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove one share.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn remove_share(&self, assistant_id: i64, user_id: i64) -> Result<(), AssistantError> {
        sqlx::query(
            "DELETE FROM assistant_shares WHERE assistant_id = ?1 AND shared_with_user_id = ?2",
        )
        .bind(assistant_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Assistants shared with a given user (non-deleted only).
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn shared_with_user(&self, user_id: i64) -> Result<Vec<Assistant>, AssistantError> {
        let rows = sqlx::query(
            "SELECT a.id, a.name, a.owner, a.description, a.system_prompt, a.prompt_template, \
                    a.metadata, p.group_id, p.group_name, p.oauth_consumer_name \
             FROM assistants a \
             JOIN assistant_shares s ON s.assistant_id = a.id \
             LEFT JOIN assistant_publications p ON p.assistant_id = a.id \
             WHERE s.shared_with_user_id = ?1 AND a.owner != ?2 ORDER BY a.id",
        )
        .bind(user_id)
        .bind(DELETED_OWNER)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_assistant).collect())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_assistant(row: sqlx::sqlite::SqliteRow) -> Assistant {
    let metadata_raw: String = row.get("metadata");
    let group_id: Option<String> = row.get("group_id");

    let publication = group_id.map(|group_id| Publication {
        group_id,
        group_name: row.get::<Option<String>, _>("group_name").unwrap_or_default(),
        oauth_consumer_name: row
            .get::<Option<String>, _>("oauth_consumer_name")
            .unwrap_or_default(),
    });

    Assistant {
        id: row.get("id"),
        name: row.get("name"),
        owner: row.get("owner"),
        description: row.get("description"),
        system_prompt: row.get("system_prompt"),
        prompt_template: row.get("prompt_template"),
        metadata: AssistantMetadata::parse(&metadata_raw),
        publication,
    }
}
