//! Lectern: a multi-tenant learning-assistant completion gateway.
//!
//! Accepts OpenAI-compatible chat-completion requests, routes them to a
//! configured assistant, resolves the assistant's organization-scoped
//! provider configuration, runs the completion pipeline (pre-retrieval →
//! retrieval → prompt assembly → connector → tool loop → post-processing),
//! and returns either a JSON completion or an SSE stream. A companion
//! knowledge-base service (collections, pluggable ingestion with progress
//! and statistics tracking, vector queries) is embedded in the same
//! process.

pub mod analytics;
pub mod assistant;
pub mod config;
pub mod db;
pub mod gateway;
pub mod kb;
pub mod logging;
pub mod org;
pub mod providers;
pub mod tools;
