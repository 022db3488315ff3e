//! External group-directory client.
//!
//! The identity provider (an external user/group directory) fronts published
//! assistants: access is granted through a group named `assistant_<id>`.
//! Lectern only ever *rewrites* a group's membership wholesale, which makes
//! re-syncing after a failure safe.

use serde_json::json;
use tracing::{debug, warn};

/// Errors talking to the group directory.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    /// Transport failure.
    #[error("group directory request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Directory rejected the operation.
    #[error("group directory returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },
}

/// Client for the external group directory.
#[derive(Debug, Clone)]
pub struct GroupDirectory {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl GroupDirectory {
    /// Build a client.
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            base_url,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    /// The group name for an assistant.
    pub fn group_name(assistant_id: i64) -> String {
        format!("assistant_{assistant_id}")
    }

    /// Rewrite a group's membership to exactly the given emails, creating
    /// the group if needed.
    ///
    /// This is the single coupling point with the directory: internal share
    /// rows are committed before this call, so a failure here leaves
    /// permission state consistent and a later re-sync converges.
    ///
    /// # Errors
    ///
    /// Returns [`GroupError`] on transport or status failure.
    pub async fn sync_membership(
        &self,
        group_name: &str,
        description: &str,
        member_emails: &[String],
    ) -> Result<(), GroupError> {
        let url = format!("{}/api/v1/groups/sync", self.base_url.trim_end_matches('/'));
        let body = json!({
            "name": group_name,
            "description": description,
            "member_emails": member_emails,
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GroupError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(group = group_name, members = member_emails.len(), "group membership synced");
        Ok(())
    }

    /// Empty a group's membership (used before soft-deleting a published
    /// assistant). Failures are reported but the caller treats them as
    /// best-effort.
    ///
    /// # Errors
    ///
    /// Returns [`GroupError`] on transport or status failure.
    pub async fn clear_membership(&self, group_name: &str) -> Result<(), GroupError> {
        match self.sync_membership(group_name, "", &[]).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(group = group_name, error = %e, "failed to clear group membership");
                Err(e)
            }
        }
    }
}
