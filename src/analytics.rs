//! Analytics read model over two chat stores.
//!
//! Merges (a) the external identity provider's chat store, filtered by a
//! `json_extract` LIKE over the chat's model list and **always** anonymized
//! to stable `User_###` labels, with (b) the internal chat store, keyed by
//! creator-user id and anonymized to `Creator_###` only when organization
//! policy requires. Anonymization counters are scoped to one response; two
//! responses never share a mapping.

use std::collections::HashMap;

use serde_json::{json, Value};
use sqlx::Row;
use sqlx::SqlitePool;

use crate::assistant::MODEL_ID_PREFIX;

/// Timeline bucketing granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    /// One bucket per day.
    Day,
    /// One bucket per ISO week.
    Week,
    /// One bucket per month.
    Month,
}

impl Period {
    /// Parse from a query value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            _ => None,
        }
    }

    /// `strftime` format deriving the bucket key.
    fn strftime(&self) -> &'static str {
        match self {
            Self::Day => "%Y-%m-%d",
            Self::Week => "%Y-W%W",
            Self::Month => "%Y-%m",
        }
    }
}

/// Per-response anonymizer with a stable mapping and its own counter.
#[derive(Debug, Default)]
pub struct Anonymizer {
    mapping: HashMap<String, String>,
    prefix: &'static str,
}

impl Anonymizer {
    /// Create an anonymizer with a label prefix (`User` / `Creator`).
    pub fn new(prefix: &'static str) -> Self {
        Self {
            mapping: HashMap::new(),
            prefix,
        }
    }

    /// Stable label for an identifier within this response.
    pub fn label(&mut self, id: &str) -> String {
        let next = self.mapping.len() + 1;
        self.mapping
            .entry(id.to_owned())
            .or_insert_with(|| format!("{}_{next:03}", self.prefix))
            .clone()
    }
}

/// Analytics read model.
#[derive(Debug, Clone)]
pub struct AnalyticsService {
    external: SqlitePool,
    internal: SqlitePool,
}

impl AnalyticsService {
    /// Build the service over the external (read-only) and internal pools.
    pub fn new(external: SqlitePool, internal: SqlitePool) -> Self {
        Self { external, internal }
    }

    /// The LIKE pattern matching chats that used an assistant.
    fn model_pattern(assistant_id: i64) -> String {
        format!("%{MODEL_ID_PREFIX}{assistant_id}%")
    }

    /// Merged chat listing for an assistant.
    ///
    /// `anonymize_internal` reflects the organization's policy for creator
    /// chats; external chats are always anonymized because their user ids
    /// are not domain entities under our control.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn chats_for_assistant(
        &self,
        assistant_id: i64,
        anonymize_internal: bool,
    ) -> Result<Vec<Value>, sqlx::Error> {
        let mut chats = Vec::new();

        // External chats: free-form user ids, always anonymized.
        let mut external_anonymizer = Anonymizer::new("User");
        let external_rows = sqlx::query(
            "SELECT id, user_id, title, created_at FROM chat \
             WHERE json_extract(chat, '$.models') LIKE ?1 ORDER BY created_at DESC",
        )
        .bind(Self::model_pattern(assistant_id))
        .fetch_all(&self.external)
        .await?;

        for row in external_rows {
            let user_id: String = row.get("user_id");
            let created_at: i64 = row.get("created_at");
            chats.push(json!({
                "id": row.get::<String, _>("id"),
                "source": "external",
                "user": external_anonymizer.label(&user_id),
                "title": row.get::<String, _>("title"),
                "created_at": created_at,
            }));
        }

        // Internal chats: creator-user ids, anonymized only on request.
        let mut internal_anonymizer = Anonymizer::new("Creator");
        let internal_rows = sqlx::query(
            "SELECT id, user_id, title, created_at FROM internal_chats \
             WHERE assistant_id = ?1 ORDER BY created_at DESC",
        )
        .bind(assistant_id)
        .fetch_all(&self.internal)
        .await?;

        for row in internal_rows {
            let user_id: i64 = row.get("user_id");
            let user = if anonymize_internal {
                internal_anonymizer.label(&user_id.to_string())
            } else {
                user_id.to_string()
            };
            chats.push(json!({
                "id": row.get::<String, _>("id"),
                "source": "internal",
                "user": user,
                "title": row.get::<String, _>("title"),
                "created_at": row.get::<String, _>("created_at"),
            }));
        }

        Ok(chats)
    }

    /// Aggregate usage stats for an assistant across both stores.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn assistant_stats(&self, assistant_id: i64) -> Result<Value, sqlx::Error> {
        let external: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM chat WHERE json_extract(chat, '$.models') LIKE ?1",
        )
        .bind(Self::model_pattern(assistant_id))
        .fetch_one(&self.external)
        .await?;

        let external_users: (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT user_id) FROM chat \
             WHERE json_extract(chat, '$.models') LIKE ?1",
        )
        .bind(Self::model_pattern(assistant_id))
        .fetch_one(&self.external)
        .await?;

        let internal: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM internal_chats WHERE assistant_id = ?1")
                .bind(assistant_id)
                .fetch_one(&self.internal)
                .await?;

        Ok(json!({
            "assistant_id": assistant_id,
            "external_chats": external.0,
            "external_unique_users": external_users.0,
            "internal_chats": internal.0,
            "total_chats": external.0 + internal.0,
        }))
    }

    /// Usage timeline bucketed by period, merged across both stores.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn timeline(
        &self,
        assistant_id: i64,
        period: Period,
    ) -> Result<Vec<Value>, sqlx::Error> {
        let format = period.strftime();
        let mut buckets: HashMap<String, i64> = HashMap::new();

        // External store keeps epoch timestamps.
        let external_rows = sqlx::query(
            "SELECT strftime(?1, datetime(created_at, 'unixepoch')) AS bucket, COUNT(*) AS n \
             FROM chat WHERE json_extract(chat, '$.models') LIKE ?2 GROUP BY bucket",
        )
        .bind(format)
        .bind(Self::model_pattern(assistant_id))
        .fetch_all(&self.external)
        .await?;

        for row in external_rows {
            let bucket: Option<String> = row.get("bucket");
            if let Some(bucket) = bucket {
                *buckets.entry(bucket).or_insert(0) += row.get::<i64, _>("n");
            }
        }

        // Internal store keeps RFC 3339 text.
        let internal_rows = sqlx::query(
            "SELECT strftime(?1, created_at) AS bucket, COUNT(*) AS n \
             FROM internal_chats WHERE assistant_id = ?2 GROUP BY bucket",
        )
        .bind(format)
        .bind(assistant_id)
        .fetch_all(&self.internal)
        .await?;

        for row in internal_rows {
            let bucket: Option<String> = row.get("bucket");
            if let Some(bucket) = bucket {
                *buckets.entry(bucket).or_insert(0) += row.get::<i64, _>("n");
            }
        }

        let mut timeline: Vec<(String, i64)> = buckets.into_iter().collect();
        timeline.sort();
        Ok(timeline
            .into_iter()
            .map(|(bucket, count)| json!({"bucket": bucket, "count": count}))
            .collect())
    }
}
