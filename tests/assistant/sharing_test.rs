//! Sharing service tests: permission gate, diff application, membership.
//!
//! The group directory points at an unroutable address; sync is
//! best-effort, so internal share state must be consistent regardless.

use std::collections::HashMap;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use lectern::assistant::groups::GroupDirectory;
use lectern::assistant::sharing::SharingService;
use lectern::assistant::store::{AssistantDraft, AssistantStore};
use lectern::assistant::{AssistantError, AssistantMetadata};
use lectern::org::store::OrgStore;
use lectern::org::{Features, OrgConfig, UserConfig, UserType};

struct Fixture {
    sharing: SharingService,
    assistants: AssistantStore,
    orgs: OrgStore,
    assistant_id: i64,
    amy: i64,
    bob: i64,
    carol: i64,
}

async fn fixture(sharing_enabled: bool) -> Fixture {
    let pool: SqlitePool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("pool");
    lectern::db::init_core_schema(&pool).await.expect("schema");

    let orgs = OrgStore::new(pool.clone());
    let assistants = AssistantStore::new(pool);

    let config = OrgConfig {
        setups: HashMap::new(),
        assistant_defaults: serde_json::json!({}),
        features: Features { sharing_enabled },
    };
    let org = orgs.create_organization("acme", "Acme", &config).await.expect("org");
    let amy = orgs
        .create_user("amy@acme.test", "Amy", org, UserType::Creator)
        .await
        .expect("amy");
    let bob = orgs
        .create_user("bob@acme.test", "Bob", org, UserType::Creator)
        .await
        .expect("bob");
    let carol = orgs
        .create_user("carol@acme.test", "Carol", org, UserType::Creator)
        .await
        .expect("carol");

    let assistant_id = assistants
        .create(&AssistantDraft {
            name: "helper".to_owned(),
            owner: "amy@acme.test".to_owned(),
            description: String::new(),
            system_prompt: String::new(),
            prompt_template: String::new(),
            metadata: AssistantMetadata::default(),
        })
        .await
        .expect("assistant");

    let directory = GroupDirectory::new("http://127.0.0.1:1".to_owned(), None);
    let sharing = SharingService::new(assistants.clone(), orgs.clone(), directory);

    Fixture {
        sharing,
        assistants,
        orgs,
        assistant_id,
        amy,
        bob,
        carol,
    }
}

#[tokio::test]
async fn update_shares_applies_set_difference() {
    let fx = fixture(true).await;
    let amy = fx.orgs.user_by_id(fx.amy).await.expect("amy");

    // Start with {bob, carol}.
    fx.sharing
        .update_shares(fx.assistant_id, &[fx.bob, fx.carol], &amy)
        .await
        .expect("initial shares");
    let mut ids = fx.assistants.share_user_ids(fx.assistant_id).await.expect("ids");
    ids.sort_unstable();
    assert_eq!(ids, vec![fx.bob, fx.carol]);

    // Desired {carol}: bob removed, nothing added.
    let shares = fx
        .sharing
        .update_shares(fx.assistant_id, &[fx.carol], &amy)
        .await
        .expect("update");
    assert_eq!(shares.len(), 1);
    assert_eq!(shares[0].user_email, "carol@acme.test");
}

#[tokio::test]
async fn desired_membership_is_owner_plus_share_targets() {
    let fx = fixture(true).await;
    let amy = fx.orgs.user_by_id(fx.amy).await.expect("amy");
    fx.sharing
        .update_shares(fx.assistant_id, &[fx.bob, fx.carol], &amy)
        .await
        .expect("shares");

    let assistant = fx.assistants.by_id(fx.assistant_id).await.expect("assistant");
    let members = fx.sharing.desired_membership(&assistant).await;
    assert_eq!(
        members,
        vec![
            "amy@acme.test".to_owned(),
            "bob@acme.test".to_owned(),
            "carol@acme.test".to_owned(),
        ]
    );
    assert_eq!(GroupDirectory::group_name(fx.assistant_id), format!("assistant_{}", fx.assistant_id));
}

#[tokio::test]
async fn non_owner_non_admin_cannot_manage_shares() {
    let fx = fixture(true).await;
    let bob = fx.orgs.user_by_id(fx.bob).await.expect("bob");

    let result = fx.sharing.update_shares(fx.assistant_id, &[fx.carol], &bob).await;
    assert!(matches!(result, Err(AssistantError::Forbidden(_))));
}

#[tokio::test]
async fn org_policy_blocks_adding_shares() {
    let fx = fixture(false).await;
    let amy = fx.orgs.user_by_id(fx.amy).await.expect("amy");

    let result = fx.sharing.update_shares(fx.assistant_id, &[fx.bob], &amy).await;
    assert!(matches!(result, Err(AssistantError::Forbidden(_))));

    // Removal (empty desired set) is still allowed.
    fx.sharing
        .update_shares(fx.assistant_id, &[], &amy)
        .await
        .expect("clearing shares works with sharing disabled");
}

#[tokio::test]
async fn user_flag_blocks_sharing() {
    let fx = fixture(true).await;
    fx.orgs
        .update_user_config(fx.amy, &UserConfig { can_share: false })
        .await
        .expect("flag off");
    let amy = fx.orgs.user_by_id(fx.amy).await.expect("amy");

    assert!(!fx.sharing.can_share(&amy).await);
    let result = fx.sharing.update_shares(fx.assistant_id, &[fx.bob], &amy).await;
    assert!(matches!(result, Err(AssistantError::Forbidden(_))));
}

#[tokio::test]
async fn shares_by_email_skips_unknown_addresses() {
    let fx = fixture(true).await;
    let amy = fx.orgs.user_by_id(fx.amy).await.expect("amy");

    let shares = fx
        .sharing
        .update_shares_by_email(
            fx.assistant_id,
            &["bob@acme.test".to_owned(), "ghost@acme.test".to_owned()],
            &amy,
        )
        .await
        .expect("update");
    assert_eq!(shares.len(), 1);
    assert_eq!(shares[0].user_email, "bob@acme.test");
}

#[tokio::test]
async fn share_candidates_exclude_caller_and_sort() {
    let fx = fixture(true).await;
    let amy = fx.orgs.user_by_id(fx.amy).await.expect("amy");

    let candidates = fx.sharing.share_candidates(&amy).await.expect("candidates");
    let names: Vec<&str> = candidates.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["Bob", "Carol"]);
}
