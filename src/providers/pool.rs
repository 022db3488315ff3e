//! Shared HTTP client pool, keyed by base URL.
//!
//! Connectors never build ad-hoc clients: one `reqwest::Client` per base URL
//! is cached process-wide with a bounded connection limit and keep-alive.
//! Creation is an idempotent check-and-set; pools outlive individual requests
//! and are only dropped on shutdown. A client that went away (evicted map
//! entry) is transparently recreated by the next caller.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tracing::debug;

/// Idle connections kept alive per host.
const POOL_IDLE_PER_HOST_DEFAULT: usize = 10;

/// Keep-alive window for pooled connections.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Process-wide pool of outbound HTTP clients.
#[derive(Debug)]
pub struct ClientPool {
    clients: RwLock<HashMap<String, reqwest::Client>>,
    max_connections: usize,
    request_timeout: Duration,
}

impl ClientPool {
    /// Create a pool with the given per-host connection bound and default
    /// request timeout.
    pub fn new(max_connections: usize, request_timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            max_connections: if max_connections == 0 {
                POOL_IDLE_PER_HOST_DEFAULT
            } else {
                max_connections
            },
            request_timeout,
        }
    }

    /// Get (or create) the client for a base URL.
    ///
    /// The fast path is a read-locked lookup; creation takes the write lock
    /// and re-checks so concurrent callers converge on one instance.
    pub fn get(&self, base_url: &str) -> reqwest::Client {
        if let Ok(map) = self.clients.read() {
            if let Some(client) = map.get(base_url) {
                return client.clone();
            }
        }

        let client = self.build_client(self.request_timeout);

        match self.clients.write() {
            Ok(mut map) => map
                .entry(base_url.to_owned())
                .or_insert_with(|| {
                    debug!(base_url, "created pooled http client");
                    client
                })
                .clone(),
            // Poisoned lock: fall back to the freshly built client so the
            // request still proceeds.
            Err(_) => client,
        }
    }

    /// Get a client with a non-default timeout (probes, long Ollama calls).
    ///
    /// Timeout-specific clients are cached under a composite key so repeat
    /// callers share connections too.
    pub fn get_with_timeout(&self, base_url: &str, timeout: Duration) -> reqwest::Client {
        let key = format!("{base_url}#{}", timeout.as_secs());

        if let Ok(map) = self.clients.read() {
            if let Some(client) = map.get(&key) {
                return client.clone();
            }
        }

        let client = self.build_client(timeout);

        match self.clients.write() {
            Ok(mut map) => map.entry(key).or_insert_with(|| client).clone(),
            Err(_) => client,
        }
    }

    fn build_client(&self, timeout: Duration) -> reqwest::Client {
        reqwest::Client::builder()
            .pool_max_idle_per_host(self.max_connections)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .timeout(timeout)
            .build()
            // Builder only fails on malformed TLS/system config; a default
            // client keeps the process serving rather than panicking.
            .unwrap_or_default()
    }

    /// Number of live clients (diagnostics).
    pub fn len(&self) -> usize {
        self.clients.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Whether the pool has no clients yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
