//! Config resolver and model-resolution policy tests.

use std::collections::HashMap;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use lectern::config::EnvProviderDefaults;
use lectern::org::resolver::{resolve_model, ConfigResolver, ConfigSource, ResolvedProvider};
use lectern::org::store::OrgStore;
use lectern::org::{Features, ModelRef, OrgConfig, ProviderSetup, Setup, UserType};

async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    lectern::db::init_core_schema(&pool).await.expect("schema");
    pool
}

fn org_config(models: &[&str], default_model: Option<&str>) -> OrgConfig {
    let mut providers = HashMap::new();
    providers.insert(
        "openai".to_owned(),
        ProviderSetup {
            enabled: true,
            api_key: Some("sk-org".to_owned()),
            base_url: Some("https://llm.acme.test/v1".to_owned()),
            default_model: default_model.map(ToOwned::to_owned),
            models: models.iter().map(|m| (*m).to_owned()).collect(),
        },
    );
    let mut setups = HashMap::new();
    setups.insert(
        "default".to_owned(),
        Setup {
            providers,
            small_fast_model: Some(ModelRef {
                provider: "openai".to_owned(),
                model: "gpt-4o-mini".to_owned(),
            }),
            global_default_model: None,
        },
    );
    OrgConfig {
        setups,
        assistant_defaults: serde_json::json!({}),
        features: Features::default(),
    }
}

async fn seed_owner(pool: &SqlitePool, email: &str, config: &OrgConfig) -> OrgStore {
    let store = OrgStore::new(pool.clone());
    let org_id = store
        .create_organization("acme", "Acme", config)
        .await
        .expect("create org");
    store
        .create_user(email, "Owner", org_id, UserType::Creator)
        .await
        .expect("create user");
    store
}

fn resolver(store: OrgStore) -> ConfigResolver {
    ConfigResolver::new(
        store,
        EnvProviderDefaults {
            openai_api_key: Some("sk-env".to_owned()),
            openai_base_url: "https://api.openai.com/v1".to_owned(),
            openai_model: "gpt-4o-mini".to_owned(),
            ollama_base_url: "http://localhost:11434".to_owned(),
            ollama_model: "llama3.1".to_owned(),
            ollama_timeout: std::time::Duration::from_secs(120),
            google_api_key: None,
        },
    )
}

#[tokio::test]
async fn owner_resolves_organization_config() {
    let pool = memory_pool().await;
    let store = seed_owner(&pool, "amy@acme.test", &org_config(&["gpt-4o-mini"], None)).await;

    let resolved = resolver(store).resolve(Some("amy@acme.test"), "openai").await;
    assert!(resolved.enabled);
    assert_eq!(resolved.source, ConfigSource::Organization);
    assert_eq!(resolved.api_key.as_deref(), Some("sk-org"));
    assert_eq!(resolved.org_name, "Acme");
    assert_eq!(resolved.small_fast_model.as_deref(), Some("gpt-4o-mini"));
}

#[tokio::test]
async fn unknown_owner_never_leaks_env_credentials() {
    let pool = memory_pool().await;
    let store = OrgStore::new(pool.clone());

    let resolved = resolver(store).resolve(Some("ghost@nowhere.test"), "openai").await;
    assert!(!resolved.enabled);
    assert!(resolved.api_key.is_none(), "env key must not leak to tenants");
    assert!(resolved.models.is_empty());
}

#[tokio::test]
async fn ownerless_request_uses_env_vars() {
    let pool = memory_pool().await;
    let store = OrgStore::new(pool.clone());

    let resolved = resolver(store).resolve(None, "openai").await;
    assert!(resolved.enabled);
    assert_eq!(resolved.source, ConfigSource::EnvVars);
    assert_eq!(resolved.api_key.as_deref(), Some("sk-env"));
}

#[tokio::test]
async fn disabled_provider_resolves_disabled() {
    let pool = memory_pool().await;
    let mut config = org_config(&["gpt-4o-mini"], None);
    if let Some(setup) = config.setups.get_mut("default") {
        if let Some(provider) = setup.providers.get_mut("openai") {
            provider.enabled = false;
        }
    }
    let store = seed_owner(&pool, "amy@acme.test", &config).await;

    let resolved = resolver(store).resolve(Some("amy@acme.test"), "openai").await;
    assert!(!resolved.enabled);
}

// -- model resolution policy ----------------------------------------------

fn provider(models: &[&str], default: Option<&str>, global: Option<&str>) -> ResolvedProvider {
    ResolvedProvider {
        enabled: true,
        api_key: None,
        base_url: None,
        default_model: default.map(ToOwned::to_owned),
        models: models.iter().map(|m| (*m).to_owned()).collect(),
        org_name: "Acme".to_owned(),
        source: ConfigSource::Organization,
        global_default_model: global.map(ToOwned::to_owned),
        small_fast_model: None,
    }
}

#[test]
fn requested_model_in_list_passes_through() {
    let resolved = resolve_model("gpt-4o", &provider(&["gpt-4o", "gpt-4o-mini"], None, None), true)
        .expect("resolves");
    assert_eq!(resolved.model, "gpt-4o");
    assert!(!resolved.fallback_used);
}

#[test]
fn unavailable_model_falls_back_to_org_default() {
    let resolved = resolve_model(
        "gpt-9",
        &provider(&["gpt-4o", "gpt-4o-mini"], Some("gpt-4o-mini"), None),
        true,
    )
    .expect("resolves");
    assert_eq!(resolved.model, "gpt-4o-mini");
    assert!(resolved.fallback_used);
}

#[test]
fn global_default_used_when_org_default_unavailable() {
    let resolved = resolve_model(
        "gpt-9",
        &provider(&["gpt-4o"], Some("not-enabled"), Some("gpt-4o")),
        true,
    )
    .expect("resolves");
    assert_eq!(resolved.model, "gpt-4o");
    assert!(resolved.fallback_used);
}

#[test]
fn first_available_is_the_last_resort() {
    let resolved =
        resolve_model("gpt-9", &provider(&["gpt-4o-mini"], None, None), true).expect("resolves");
    assert_eq!(resolved.model, "gpt-4o-mini");
    assert!(resolved.fallback_used);
}

#[test]
fn strict_mode_rejects_empty_model_list() {
    let result = resolve_model("gpt-9", &provider(&[], None, None), true);
    assert!(result.is_err());
}

#[test]
fn lenient_mode_trusts_requested_model() {
    // Ollama may serve models absent from the tenant config.
    let resolved = resolve_model("qwen3:8b", &provider(&[], None, None), false).expect("resolves");
    assert_eq!(resolved.model, "qwen3:8b");
    assert!(!resolved.fallback_used);
}
