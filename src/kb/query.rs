//! Plugin-dispatched collection queries.
//!
//! The public query surface resolves a query plugin by name (defaulting to
//! `simple_query`), sanitizes the parameters according to the plugin's
//! mode, and runs it. The same service backs the assistant executor's
//! retrieval step.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::assistant::executor::{RetrievedChunk, Retriever};

use super::plugins::{PluginRegistry, QueryHit};
use super::store::KbStore;
use super::KbError;

/// Default query plugin name.
const DEFAULT_QUERY_PLUGIN: &str = "simple_query";

/// Query dispatch service.
#[derive(Clone)]
pub struct QueryService {
    store: KbStore,
    registry: Arc<PluginRegistry>,
}

impl QueryService {
    /// Build the service.
    pub fn new(store: KbStore, registry: Arc<PluginRegistry>) -> Self {
        Self { store, registry }
    }

    /// Run a similarity query against one collection.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::NotFound`] for a missing collection and
    /// [`KbError::UnknownPlugin`] for an unregistered plugin.
    pub async fn query(
        &self,
        collection_id: i64,
        query_text: &str,
        plugin_name: Option<&str>,
        params: Value,
    ) -> Result<Vec<QueryHit>, KbError> {
        let name = plugin_name.unwrap_or(DEFAULT_QUERY_PLUGIN);
        let plugin = self
            .registry
            .query_plugin(name)
            .ok_or_else(|| KbError::UnknownPlugin(name.to_owned()))?;

        let collection = self.store.collection_by_id(collection_id).await?;
        let params = self.registry.sanitize_query_params(name, params);

        debug!(collection = collection_id, plugin = name, "dispatching query");
        plugin.query(&collection, query_text, &params).await
    }
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Retriever for QueryService {
    async fn query(
        &self,
        collection_id: &str,
        query_text: &str,
        top_k: u32,
    ) -> Result<Vec<RetrievedChunk>, String> {
        let id: i64 = collection_id
            .parse()
            .map_err(|_| format!("invalid collection id '{collection_id}'"))?;

        let hits = QueryService::query(self, id, query_text, None, json!({"top_k": top_k}))
            .await
            .map_err(|e| e.to_string())?;

        Ok(hits
            .into_iter()
            .map(|hit| RetrievedChunk {
                similarity: hit.similarity,
                data: hit.data,
                metadata: hit.metadata,
            })
            .collect())
    }
}
