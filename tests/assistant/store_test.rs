//! Assistant store tests: CRUD, soft delete, publication, shares.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use lectern::assistant::store::{AssistantDraft, AssistantStore};
use lectern::assistant::{AssistantError, AssistantMetadata, Publication, DELETED_OWNER};
use lectern::org::store::OrgStore;
use lectern::org::{OrgConfig, UserType};

async fn pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("pool");
    lectern::db::init_core_schema(&pool).await.expect("schema");
    pool
}

fn draft(name: &str, owner: &str) -> AssistantDraft {
    AssistantDraft {
        name: name.to_owned(),
        owner: owner.to_owned(),
        description: "a helper".to_owned(),
        system_prompt: "be helpful".to_owned(),
        prompt_template: String::new(),
        metadata: AssistantMetadata::default(),
    }
}

#[tokio::test]
async fn create_and_fetch() {
    let store = AssistantStore::new(pool().await);
    let id = store.create(&draft("helper", "amy@acme.test")).await.expect("create");

    let assistant = store.by_id(id).await.expect("fetch");
    assert_eq!(assistant.name, "helper");
    assert_eq!(assistant.owner, "amy@acme.test");
    assert_eq!(assistant.model_id(), format!("lectern_assistant.{id}"));
    assert!(assistant.publication.is_none());
}

#[tokio::test]
async fn name_unique_per_owner_not_globally() {
    let store = AssistantStore::new(pool().await);
    store.create(&draft("helper", "amy@acme.test")).await.expect("first");

    let conflict = store.create(&draft("helper", "amy@acme.test")).await;
    assert!(matches!(conflict, Err(AssistantError::InvalidName(_))));

    // Another owner may reuse the name.
    store.create(&draft("helper", "bob@acme.test")).await.expect("other owner");
}

#[tokio::test]
async fn invalid_names_rejected() {
    let store = AssistantStore::new(pool().await);
    let result = store.create(&draft("bad name!", "amy@acme.test")).await;
    assert!(matches!(result, Err(AssistantError::InvalidName(_))));
}

#[tokio::test]
async fn soft_delete_renames_and_hides() {
    let store = AssistantStore::new(pool().await);
    let id = store.create(&draft("helper", "amy@acme.test")).await.expect("create");

    store.soft_delete(id).await.expect("soft delete");

    // Hidden from normal reads…
    assert!(matches!(store.by_id(id).await, Err(AssistantError::NotFound)));

    // …but the row survives with the sentinel owner and a suffixed name.
    let raw = store.by_id_raw(id).await.expect("raw fetch");
    assert_eq!(raw.owner, DELETED_OWNER);
    assert!(raw.name.starts_with("helper_deleted_"));
    assert!(raw.is_deleted());

    // The old (name, owner) key is free again.
    store.create(&draft("helper", "amy@acme.test")).await.expect("name reusable");
}

#[tokio::test]
async fn publication_lifecycle() {
    let store = AssistantStore::new(pool().await);
    let id = store.create(&draft("helper", "amy@acme.test")).await.expect("create");

    assert!(store.list_published().await.expect("list").is_empty());

    store
        .publish(
            id,
            &Publication {
                group_id: "grp-1".to_owned(),
                group_name: "Course A".to_owned(),
                oauth_consumer_name: "lms".to_owned(),
            },
        )
        .await
        .expect("publish");

    let published = store.list_published().await.expect("list");
    assert_eq!(published.len(), 1);
    let publication = published[0].publication.as_ref().expect("publication");
    assert_eq!(publication.group_id, "grp-1");

    // Republish updates in place.
    store
        .publish(
            id,
            &Publication {
                group_id: "grp-2".to_owned(),
                group_name: "Course B".to_owned(),
                oauth_consumer_name: "lms".to_owned(),
            },
        )
        .await
        .expect("republish");
    let fetched = store.by_id(id).await.expect("fetch");
    assert_eq!(fetched.publication.expect("publication").group_id, "grp-2");

    store.unpublish(id).await.expect("unpublish");
    assert!(store.list_published().await.expect("list").is_empty());
}

#[tokio::test]
async fn soft_deleted_assistants_never_listed_as_published() {
    let store = AssistantStore::new(pool().await);
    let id = store.create(&draft("helper", "amy@acme.test")).await.expect("create");
    store
        .publish(
            id,
            &Publication {
                group_id: "grp-1".to_owned(),
                group_name: "Course".to_owned(),
                oauth_consumer_name: String::new(),
            },
        )
        .await
        .expect("publish");

    store.soft_delete(id).await.expect("soft delete");
    assert!(store.list_published().await.expect("list").is_empty());
}

#[tokio::test]
async fn shares_add_remove_and_join_identity() {
    let db = pool().await;
    let orgs = OrgStore::new(db.clone());
    let store = AssistantStore::new(db);

    let org = orgs
        .create_organization("acme", "Acme", &OrgConfig::default())
        .await
        .expect("org");
    let amy = orgs
        .create_user("amy@acme.test", "Amy", org, UserType::Creator)
        .await
        .expect("amy");
    let bob = orgs
        .create_user("bob@acme.test", "Bob", org, UserType::Creator)
        .await
        .expect("bob");

    let id = store.create(&draft("helper", "amy@acme.test")).await.expect("create");

    store.add_share(id, bob, amy).await.expect("share");
    // Duplicate shares are ignored.
    store.add_share(id, bob, amy).await.expect("re-share");

    let shares = store.shares(id).await.expect("shares");
    assert_eq!(shares.len(), 1);
    assert_eq!(shares[0].user_email, "bob@acme.test");
    assert_eq!(shares[0].shared_by_name, "Amy");

    let shared_with_bob = store.shared_with_user(bob).await.expect("listing");
    assert_eq!(shared_with_bob.len(), 1);
    assert_eq!(shared_with_bob[0].id, id);

    store.remove_share(id, bob).await.expect("unshare");
    assert!(store.shares(id).await.expect("shares").is_empty());
}

#[tokio::test]
async fn pagination_reports_total() {
    let store = AssistantStore::new(pool().await);
    for i in 0..5 {
        store
            .create(&draft(&format!("helper-{i}"), "amy@acme.test"))
            .await
            .expect("create");
    }

    let (page, total) = store.list_by_owner("amy@acme.test", 2, 2).await.expect("page");
    assert_eq!(total, 5);
    assert_eq!(page.len(), 2);
    // Newest first.
    assert_eq!(page[0].name, "helper-2");
}
