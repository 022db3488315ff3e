//! Client pool tests.

use std::time::Duration;

use lectern::providers::pool::ClientPool;

#[test]
fn pool_starts_empty() {
    let pool = ClientPool::new(10, Duration::from_secs(120));
    assert!(pool.is_empty());
}

#[test]
fn one_client_per_base_url() {
    let pool = ClientPool::new(10, Duration::from_secs(120));
    let _a = pool.get("https://api.openai.com/v1");
    let _b = pool.get("https://api.openai.com/v1");
    let _c = pool.get("http://localhost:11434");
    assert_eq!(pool.len(), 2);
}

#[test]
fn timeout_variants_are_cached_separately() {
    let pool = ClientPool::new(10, Duration::from_secs(120));
    let _default = pool.get("http://localhost:11434");
    let _probe = pool.get_with_timeout("http://localhost:11434", Duration::from_secs(10));
    let _probe_again = pool.get_with_timeout("http://localhost:11434", Duration::from_secs(10));
    assert_eq!(pool.len(), 2);
}

#[test]
fn zero_connection_bound_falls_back_to_default() {
    // Misconfigured LLM_MAX_CONNECTIONS=0 must not produce a useless pool.
    let pool = ClientPool::new(0, Duration::from_secs(5));
    let _client = pool.get("http://example.test");
    assert_eq!(pool.len(), 1);
}
