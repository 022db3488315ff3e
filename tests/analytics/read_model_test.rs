//! Analytics read-model tests over two seeded chat stores.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use lectern::analytics::{AnalyticsService, Anonymizer, Period};

async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("pool")
}

/// Build an external chat store shaped like the identity provider's.
async fn external_store() -> SqlitePool {
    let pool = memory_pool().await;
    sqlx::query(
        "CREATE TABLE chat (id TEXT PRIMARY KEY, user_id TEXT, title TEXT, \
         chat TEXT, created_at INTEGER)",
    )
    .execute(&pool)
    .await
    .expect("schema");

    for (id, user, title, assistant, created) in [
        ("c1", "u-111", "first", 7, 1_700_000_000_i64),
        ("c2", "u-222", "second", 7, 1_700_086_400),
        ("c3", "u-111", "third", 7, 1_700_086_500),
        ("c4", "u-333", "other assistant", 9, 1_700_000_000),
    ] {
        let chat = format!("{{\"models\": [\"lectern_assistant.{assistant}\"]}}");
        sqlx::query("INSERT INTO chat VALUES (?1, ?2, ?3, ?4, ?5)")
            .bind(id)
            .bind(user)
            .bind(title)
            .bind(chat)
            .bind(created)
            .execute(&pool)
            .await
            .expect("seed");
    }
    pool
}

async fn internal_store() -> SqlitePool {
    let pool = memory_pool().await;
    lectern::db::init_core_schema(&pool).await.expect("schema");
    for (id, assistant, user, title, created) in [
        ("i1", 7, 42, "internal one", "2023-11-14 10:00:00"),
        ("i2", 7, 43, "internal two", "2023-11-15 10:00:00"),
        ("i3", 8, 42, "other", "2023-11-15 10:00:00"),
    ] {
        sqlx::query(
            "INSERT INTO internal_chats (id, assistant_id, user_id, title, chat, created_at) \
             VALUES (?1, ?2, ?3, ?4, '{}', ?5)",
        )
        .bind(id)
        .bind(assistant)
        .bind(user)
        .bind(title)
        .bind(created)
        .execute(&pool)
        .await
        .expect("seed");
    }
    pool
}

async fn service() -> AnalyticsService {
    AnalyticsService::new(external_store().await, internal_store().await)
}

#[tokio::test]
async fn merges_both_stores_filtered_by_assistant() {
    let service = service().await;
    let chats = service.chats_for_assistant(7, false).await.expect("chats");

    let external = chats.iter().filter(|c| c["source"] == "external").count();
    let internal = chats.iter().filter(|c| c["source"] == "internal").count();
    assert_eq!(external, 3, "assistant 9's chat is filtered out");
    assert_eq!(internal, 2, "assistant 8's chat is filtered out");
}

#[tokio::test]
async fn external_users_always_anonymized_and_stable() {
    let service = service().await;
    let chats = service.chats_for_assistant(7, false).await.expect("chats");

    let external_users: Vec<&str> = chats
        .iter()
        .filter(|c| c["source"] == "external")
        .filter_map(|c| c["user"].as_str())
        .collect();

    // Raw ids never appear.
    assert!(external_users.iter().all(|u| u.starts_with("User_")));
    // The same source id maps to the same label within one response.
    assert_eq!(external_users[0], "User_001");
    assert_eq!(external_users[2], "User_001", "u-111 appears twice, same label");
    assert_eq!(external_users[1], "User_002");
}

#[tokio::test]
async fn internal_users_anonymized_only_on_request() {
    let service = service().await;

    let plain = service.chats_for_assistant(7, false).await.expect("chats");
    // Newest first: i2 (user 43) precedes i1 (user 42).
    let internal_plain: Vec<&str> = plain
        .iter()
        .filter(|c| c["source"] == "internal")
        .filter_map(|c| c["user"].as_str())
        .collect();
    assert_eq!(internal_plain, vec!["43", "42"]);

    let anonymized = service.chats_for_assistant(7, true).await.expect("chats");
    let internal_anon: Vec<&str> = anonymized
        .iter()
        .filter(|c| c["source"] == "internal")
        .filter_map(|c| c["user"].as_str())
        .collect();
    assert!(internal_anon.iter().all(|u| u.starts_with("Creator_")));
}

#[tokio::test]
async fn stats_count_across_stores() {
    let service = service().await;
    let stats = service.assistant_stats(7).await.expect("stats");
    assert_eq!(stats["external_chats"], 3);
    assert_eq!(stats["external_unique_users"], 2);
    assert_eq!(stats["internal_chats"], 2);
    assert_eq!(stats["total_chats"], 5);
}

#[tokio::test]
async fn timeline_buckets_by_day() {
    let service = service().await;
    let timeline = service.timeline(7, Period::Day).await.expect("timeline");

    // 1_700_000_000 is 2023-11-14; 1_700_086_400/1_700_086_500 are 11-15.
    // Internal adds one chat on each day.
    let day_one = timeline
        .iter()
        .find(|b| b["bucket"] == "2023-11-14")
        .expect("bucket");
    let day_two = timeline
        .iter()
        .find(|b| b["bucket"] == "2023-11-15")
        .expect("bucket");
    assert_eq!(day_one["count"], 2);
    assert_eq!(day_two["count"], 3);
}

#[tokio::test]
async fn timeline_buckets_by_month() {
    let service = service().await;
    let timeline = service.timeline(7, Period::Month).await.expect("timeline");
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0]["bucket"], "2023-11");
    assert_eq!(timeline[0]["count"], 5);
}

#[test]
fn period_parses() {
    assert_eq!(Period::parse("day"), Some(Period::Day));
    assert_eq!(Period::parse("week"), Some(Period::Week));
    assert_eq!(Period::parse("month"), Some(Period::Month));
    assert_eq!(Period::parse("year"), None);
}

#[test]
fn anonymizer_counters_are_per_instance() {
    let mut first = Anonymizer::new("User");
    assert_eq!(first.label("a"), "User_001");
    assert_eq!(first.label("b"), "User_002");
    assert_eq!(first.label("a"), "User_001");

    // A fresh response starts a fresh mapping.
    let mut second = Anonymizer::new("User");
    assert_eq!(second.label("z"), "User_001");
}
