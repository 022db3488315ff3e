//! Organization and creator-user store tests.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use lectern::org::store::OrgStore;
use lectern::org::{OrgConfig, OrgError, UserConfig, UserType, SYSTEM_ORG_SLUG};

async fn store() -> OrgStore {
    let pool: SqlitePool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    lectern::db::init_core_schema(&pool).await.expect("schema");
    OrgStore::new(pool)
}

#[tokio::test]
async fn create_and_fetch_organization() {
    let store = store().await;
    let id = store
        .create_organization("acme", "Acme Corp", &OrgConfig::default())
        .await
        .expect("create");

    let by_id = store.organization_by_id(id).await.expect("by id");
    assert_eq!(by_id.slug, "acme");
    assert!(!by_id.is_system);
    assert!(by_id.config.features.sharing_enabled, "sharing defaults on");

    let by_slug = store.organization_by_slug("acme").await.expect("by slug");
    assert_eq!(by_slug.id, id);
}

#[tokio::test]
async fn system_organization_cannot_be_deleted() {
    let store = store().await;
    let id = store
        .create_organization(SYSTEM_ORG_SLUG, "System", &OrgConfig::default())
        .await
        .expect("create system");

    let result = store.delete_organization(id).await;
    assert!(matches!(result, Err(OrgError::SystemOrgProtected)));
    assert!(store.organization_by_id(id).await.is_ok());
}

#[tokio::test]
async fn regular_organization_deletes() {
    let store = store().await;
    let id = store
        .create_organization("acme", "Acme", &OrgConfig::default())
        .await
        .expect("create");
    store.delete_organization(id).await.expect("delete");
    assert!(store.organization_by_id(id).await.is_err());
}

#[tokio::test]
async fn user_defaults_and_config_roundtrip() {
    let store = store().await;
    let org = store
        .create_organization("acme", "Acme", &OrgConfig::default())
        .await
        .expect("org");
    let user_id = store
        .create_user("amy@acme.test", "Amy", org, UserType::Creator)
        .await
        .expect("user");

    let user = store.user_by_id(user_id).await.expect("fetch");
    assert_eq!(user.email, "amy@acme.test");
    assert_eq!(user.user_type, UserType::Creator);
    assert!(user.enabled);
    assert!(!user.is_admin);
    assert!(user.user_config.can_share, "can_share defaults true");

    store
        .update_user_config(user_id, &UserConfig { can_share: false })
        .await
        .expect("update");
    let updated = store.user_by_id(user_id).await.expect("refetch");
    assert!(!updated.user_config.can_share);
}

#[tokio::test]
async fn organization_for_owner_walks_the_join() {
    let store = store().await;
    let org = store
        .create_organization("acme", "Acme", &OrgConfig::default())
        .await
        .expect("org");
    store
        .create_user("amy@acme.test", "Amy", org, UserType::Creator)
        .await
        .expect("user");

    let resolved = store
        .organization_for_owner("amy@acme.test")
        .await
        .expect("resolve");
    assert_eq!(resolved.id, org);
}

#[tokio::test]
async fn users_listed_alphabetically() {
    let store = store().await;
    let org = store
        .create_organization("acme", "Acme", &OrgConfig::default())
        .await
        .expect("org");
    for (email, name) in [("c@t", "carol"), ("a@t", "Alice"), ("b@t", "bob")] {
        store
            .create_user(email, name, org, UserType::Creator)
            .await
            .expect("user");
    }

    let users = store.users_in_organization(org).await.expect("list");
    let names: Vec<&str> = users.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["Alice", "bob", "carol"]);
}

#[test]
fn user_type_round_trips() {
    assert_eq!(UserType::parse("creator"), UserType::Creator);
    assert_eq!(UserType::parse("end_user"), UserType::EndUser);
    assert_eq!(UserType::parse("anything-else"), UserType::Creator);
    assert_eq!(UserType::EndUser.as_str(), "end_user");
}
