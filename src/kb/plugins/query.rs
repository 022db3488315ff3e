//! Default similarity query plugin.
//!
//! Embeds the query text with the collection's own embedding function and
//! runs a nearest-neighbour search against the vector store. `top_k` and
//! `threshold` are the standard parameters every query plugin accepts.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::kb::embeddings::Embedder;
use crate::kb::models::Collection;
use crate::kb::store::KbStore;
use crate::kb::vector::VectorStore;
use crate::kb::KbError;
use crate::providers::pool::ClientPool;

use super::{ParamSpec, QueryHit, QueryPlugin};

/// Default number of results.
const DEFAULT_TOP_K: u32 = 5;

/// Default similarity plugin.
pub struct SimpleQuery {
    pool: Arc<ClientPool>,
    store: KbStore,
    vector: VectorStore,
}

impl SimpleQuery {
    /// Build the plugin.
    pub fn new(pool: Arc<ClientPool>, store: KbStore, vector: VectorStore) -> Self {
        Self {
            pool,
            store,
            vector,
        }
    }
}

#[async_trait::async_trait]
impl QueryPlugin for SimpleQuery {
    fn name(&self) -> &'static str {
        "simple_query"
    }

    fn description(&self) -> &'static str {
        "Similarity search using the collection's embedding function"
    }

    fn parameters(&self) -> BTreeMap<&'static str, ParamSpec> {
        BTreeMap::from([
            (
                "top_k",
                ParamSpec {
                    kind: "integer",
                    description: "Number of results to return",
                    default: json!(DEFAULT_TOP_K),
                    required: false,
                    options: None,
                },
            ),
            (
                "threshold",
                ParamSpec {
                    kind: "number",
                    description: "Minimum similarity (0-1); results below are dropped",
                    default: json!(0.0),
                    required: false,
                    options: None,
                },
            ),
        ])
    }

    async fn query(
        &self,
        collection: &Collection,
        query_text: &str,
        params: &Value,
    ) -> Result<Vec<QueryHit>, KbError> {
        let top_k = params
            .get("top_k")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(DEFAULT_TOP_K)
            .max(1);
        let threshold = params
            .get("threshold")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let Some(uuid) = collection.vector_store_uuid.clone() else {
            return Err(KbError::Validation(format!(
                "collection {} has no vector store",
                collection.id
            )));
        };

        let config = self.store.effective_embeddings(collection).await?;
        let embedder = Embedder::from_config(Arc::clone(&self.pool), config)?;
        let embedding = embedder.embed_one(query_text).await?;

        let hits = self.vector.query(&uuid, &embedding, top_k).await?;
        debug!(collection = collection.id, hits = hits.len(), "similarity query");

        Ok(hits
            .into_iter()
            .map(|hit| {
                let similarity = hit.similarity();
                QueryHit {
                    similarity,
                    data: hit.document,
                    metadata: hit.metadata,
                }
            })
            .filter(|hit| hit.similarity >= threshold)
            .collect())
    }
}

impl std::fmt::Debug for SimpleQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleQuery").finish_non_exhaustive()
    }
}
