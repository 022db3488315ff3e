//! Assistant sharing and authorization.
//!
//! An assistant is reachable by its owner, any admin, and any user it is
//! shared with. Share mutations are computed as set differences against the
//! desired final state, committed internally first, and then mirrored to the
//! external directory group `assistant_<id>` in a single best-effort sync.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::org::store::OrgStore;
use crate::org::CreatorUser;

use super::groups::GroupDirectory;
use super::store::{AssistantStore, ShareView};
use super::{Assistant, AssistantError};

/// Sharing service.
#[derive(Debug, Clone)]
pub struct SharingService {
    assistants: AssistantStore,
    users: OrgStore,
    directory: GroupDirectory,
}

impl SharingService {
    /// Build the service.
    pub fn new(assistants: AssistantStore, users: OrgStore, directory: GroupDirectory) -> Self {
        Self {
            assistants,
            users,
            directory,
        }
    }

    // -- authorization ------------------------------------------------------

    /// Whether a user may reach an assistant (owner, admin, or share target).
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn can_access(
        &self,
        assistant: &Assistant,
        user: &CreatorUser,
    ) -> Result<bool, AssistantError> {
        if assistant.owner == user.email || user.is_admin {
            return Ok(true);
        }
        let shared = self.assistants.share_user_ids(assistant.id).await?;
        Ok(shared.contains(&user.id))
    }

    /// Whether a user may share assistants at all: the organization feature
    /// and the per-user flag must both hold (both default to true).
    pub async fn can_share(&self, user: &CreatorUser) -> bool {
        if !user.user_config.can_share {
            return false;
        }
        match self.users.organization_by_id(user.organization_id).await {
            Ok(org) => org.config.features.sharing_enabled,
            // Orgless users keep the default-enabled behavior.
            Err(_) => true,
        }
    }

    // -- shares -------------------------------------------------------------

    /// Current shares of an assistant, with user identity.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::NotFound`] when the assistant is missing.
    pub async fn list_shares(&self, assistant_id: i64) -> Result<Vec<ShareView>, AssistantError> {
        let _ = self.assistants.by_id(assistant_id).await?;
        self.assistants.shares(assistant_id).await
    }

    /// Users available as share targets: same organization, excluding the
    /// caller, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn share_candidates(
        &self,
        current_user: &CreatorUser,
    ) -> Result<Vec<CreatorUser>, AssistantError> {
        let users = self
            .users
            .users_in_organization(current_user.organization_id)
            .await
            .map_err(|e| AssistantError::Forbidden(e.to_string()))?;
        Ok(users
            .into_iter()
            .filter(|u| u.id != current_user.id)
            .collect())
    }

    /// Replace the share list with the desired final state.
    ///
    /// Computes `add = desired − current` and `remove = current − desired`,
    /// applies both, then performs one membership sync that rewrites the
    /// external group to `{owner} ∪ {shared-with emails}`. Internal writes
    /// commit first; a sync failure is logged and does not revert them.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Forbidden`] when the caller is neither the
    /// owner nor an admin, or when sharing is disabled and shares are being
    /// added.
    pub async fn update_shares(
        &self,
        assistant_id: i64,
        desired_user_ids: &[i64],
        current_user: &CreatorUser,
    ) -> Result<Vec<ShareView>, AssistantError> {
        let assistant = self.assistants.by_id(assistant_id).await?;

        let is_owner = assistant.owner == current_user.email;
        if !is_owner && !current_user.is_admin {
            return Err(AssistantError::Forbidden(
                "only the owner or an admin can manage assistant sharing".to_owned(),
            ));
        }

        // The permission gate applies to adding shares; removal is always
        // allowed so a disabled org can still retract access.
        if !desired_user_ids.is_empty() && !self.can_share(current_user).await {
            return Err(AssistantError::Forbidden(
                "sharing is not enabled for your organization".to_owned(),
            ));
        }

        let current: BTreeSet<i64> = self
            .assistants
            .share_user_ids(assistant_id)
            .await?
            .into_iter()
            .collect();
        let desired: BTreeSet<i64> = desired_user_ids.iter().copied().collect();

        let mut added = 0usize;
        for user_id in desired.difference(&current) {
            self.assistants
                .add_share(assistant_id, *user_id, current_user.id)
                .await?;
            added += 1;
        }

        let mut removed = 0usize;
        for user_id in current.difference(&desired) {
            self.assistants.remove_share(assistant_id, *user_id).await?;
            removed += 1;
        }

        info!(assistant_id, added, removed, "assistant shares updated");
        self.sync_group(&assistant).await;

        self.assistants.shares(assistant_id).await
    }

    /// Replace the share list using emails instead of ids. Unknown emails
    /// are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Same as [`SharingService::update_shares`].
    pub async fn update_shares_by_email(
        &self,
        assistant_id: i64,
        emails: &[String],
        current_user: &CreatorUser,
    ) -> Result<Vec<ShareView>, AssistantError> {
        let mut user_ids = Vec::with_capacity(emails.len());
        for email in emails {
            match self.users.user_by_email(email).await {
                Ok(user) => user_ids.push(user.id),
                Err(_) => warn!(email, "share target not found, skipping"),
            }
        }
        self.update_shares(assistant_id, &user_ids, current_user)
            .await
    }

    /// Assistants shared with a user.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn shared_with(&self, user_id: i64) -> Result<Vec<Assistant>, AssistantError> {
        self.assistants.shared_with_user(user_id).await
    }

    /// Admin toggle of a user's sharing permission.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Forbidden`] unless the caller is an admin.
    pub async fn set_user_can_share(
        &self,
        target_user_id: i64,
        can_share: bool,
        admin: &CreatorUser,
    ) -> Result<(), AssistantError> {
        if !admin.is_admin {
            return Err(AssistantError::Forbidden("admin access required".to_owned()));
        }

        let target = self
            .users
            .user_by_id(target_user_id)
            .await
            .map_err(|_| AssistantError::NotFound)?;
        let mut config = target.user_config;
        config.can_share = can_share;
        self.users
            .update_user_config(target_user_id, &config)
            .await
            .map_err(|e| AssistantError::Forbidden(e.to_string()))?;
        Ok(())
    }

    // -- group sync ---------------------------------------------------------

    /// Desired external-group membership: owner plus shared-with emails.
    pub async fn desired_membership(&self, assistant: &Assistant) -> Vec<String> {
        let mut emails = vec![assistant.owner.clone()];
        if let Ok(shares) = self.assistants.shares(assistant.id).await {
            emails.extend(shares.into_iter().map(|s| s.user_email));
        }
        emails
    }

    /// One best-effort membership rewrite of `assistant_<id>`.
    async fn sync_group(&self, assistant: &Assistant) {
        let group = GroupDirectory::group_name(assistant.id);
        let members = self.desired_membership(assistant).await;
        let description = format!("Shared access for assistant {}", assistant.name);

        if let Err(e) = self
            .directory
            .sync_membership(&group, &description, &members)
            .await
        {
            // Outbox semantics: internal state is already consistent and a
            // later sync rewrites the full membership set.
            warn!(group, error = %e, "external group sync failed");
        }
    }
}
