//! SQLite pool bootstrap and background maintenance.
//!
//! Two databases are managed here: the core database (organizations, users,
//! assistants, shares, internal chats) and the knowledge-base database
//! (collections, embeddings setups, file registry). Both are opened with WAL
//! mode and idempotent `CREATE TABLE IF NOT EXISTS` bootstrap so a fresh
//! deployment needs no migration step.
//!
//! Optional maintenance loops (WAL checkpoint, `ANALYZE` + `PRAGMA optimize`,
//! `VACUUM`) run on cron schedules; they are disabled by default to avoid
//! duplication under dev reload.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::MaintenanceSettings;

/// Maximum connections per pool.
const POOL_MAX_CONNECTIONS: u32 = 20;

// ---------------------------------------------------------------------------
// Pool creation
// ---------------------------------------------------------------------------

/// Open a SQLite pool with WAL mode and pragma tuning, creating the file and
/// parent directories if missing.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the pool cannot be
/// opened.
pub async fn open_pool(path: &Path) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            anyhow::anyhow!("failed to create database directory {}: {e}", parent.display())
        })?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .pragma("cache_size", "-64000")
        .pragma("temp_store", "MEMORY")
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    info!(path = %path.display(), "sqlite pool opened");
    Ok(pool)
}

/// Open a read-only pool over an externally owned database.
///
/// Used for the identity provider's chat store in the analytics read model.
///
/// # Errors
///
/// Returns an error if the file does not exist or cannot be opened.
pub async fn open_readonly_pool(path: &Path) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    info!(path = %path.display(), "read-only sqlite pool opened");
    Ok(pool)
}

// ---------------------------------------------------------------------------
// Schema bootstrap
// ---------------------------------------------------------------------------

/// Create the core schema if it does not exist.
///
/// # Errors
///
/// Returns an error if any DDL statement fails.
pub async fn init_core_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS organizations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            is_system INTEGER NOT NULL DEFAULT 0,
            config TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        "CREATE TABLE IF NOT EXISTS creator_users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            organization_id INTEGER NOT NULL REFERENCES organizations(id),
            user_type TEXT NOT NULL DEFAULT 'creator',
            enabled INTEGER NOT NULL DEFAULT 1,
            is_admin INTEGER NOT NULL DEFAULT 0,
            user_config TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE TABLE IF NOT EXISTS assistants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            owner TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            system_prompt TEXT NOT NULL DEFAULT '',
            prompt_template TEXT NOT NULL DEFAULT '',
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(name, owner)
        )",
        "CREATE TABLE IF NOT EXISTS assistant_publications (
            assistant_id INTEGER PRIMARY KEY REFERENCES assistants(id) ON DELETE CASCADE,
            group_id TEXT NOT NULL,
            group_name TEXT NOT NULL,
            oauth_consumer_name TEXT NOT NULL DEFAULT ''
        )",
        "CREATE TABLE IF NOT EXISTS assistant_shares (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            assistant_id INTEGER NOT NULL REFERENCES assistants(id) ON DELETE CASCADE,
            shared_with_user_id INTEGER NOT NULL REFERENCES creator_users(id),
            shared_by_user_id INTEGER NOT NULL REFERENCES creator_users(id),
            shared_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(assistant_id, shared_with_user_id)
        )",
        "CREATE TABLE IF NOT EXISTS internal_chats (
            id TEXT PRIMARY KEY,
            assistant_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            chat TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        "CREATE INDEX IF NOT EXISTS idx_assistants_owner ON assistants(owner)",
        "CREATE INDEX IF NOT EXISTS idx_internal_chats_assistant
            ON internal_chats(assistant_id)",
    ];

    for sql in statements {
        sqlx::query(sql).execute(pool).await?;
    }

    debug!("core schema initialised");
    Ok(())
}

/// Create the knowledge-base schema if it does not exist.
///
/// # Errors
///
/// Returns an error if any DDL statement fails.
pub async fn init_kb_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS embeddings_setups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            vendor TEXT NOT NULL,
            model TEXT NOT NULL,
            api_key TEXT,
            api_endpoint TEXT,
            dimensions INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS collections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            description TEXT,
            owner TEXT NOT NULL,
            visibility TEXT NOT NULL DEFAULT 'private',
            embeddings_setup_id INTEGER REFERENCES embeddings_setups(id),
            embeddings_model TEXT,
            embedding_dimensions INTEGER NOT NULL DEFAULT 0,
            vector_store_uuid TEXT UNIQUE,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(name, owner)
        )",
        "CREATE TABLE IF NOT EXISTS file_registry (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
            owner TEXT NOT NULL,
            original_filename TEXT NOT NULL,
            file_path TEXT NOT NULL,
            file_url TEXT NOT NULL DEFAULT '',
            file_size INTEGER NOT NULL DEFAULT 0,
            content_type TEXT,
            plugin_name TEXT NOT NULL,
            plugin_params TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending',
            document_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            processing_started_at TEXT,
            processing_completed_at TEXT,
            progress_current INTEGER NOT NULL DEFAULT 0,
            progress_total INTEGER NOT NULL DEFAULT 0,
            progress_message TEXT,
            error_message TEXT,
            error_details TEXT,
            processing_stats TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_file_registry_collection
            ON file_registry(collection_id)",
        "CREATE INDEX IF NOT EXISTS idx_file_registry_status ON file_registry(status)",
        "CREATE INDEX IF NOT EXISTS idx_collections_owner ON collections(owner)",
    ];

    for sql in statements {
        sqlx::query(sql).execute(pool).await?;
    }

    debug!("knowledge-base schema initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Background maintenance
// ---------------------------------------------------------------------------

/// Spawn the maintenance loops for a pool if enabled.
///
/// Each loop sleeps until the next cron trigger, runs its statement, and
/// repeats. Invalid cron expressions disable the affected loop with a
/// warning rather than failing startup.
pub fn spawn_maintenance(pool: SqlitePool, settings: &MaintenanceSettings) {
    if !settings.enabled {
        debug!("database maintenance disabled");
        return;
    }

    spawn_cron_statements(
        pool.clone(),
        settings.checkpoint_cron.clone(),
        "wal_checkpoint",
        &["PRAGMA wal_checkpoint(TRUNCATE)"],
    );
    spawn_cron_statements(
        pool.clone(),
        settings.analyze_cron.clone(),
        "analyze",
        &["ANALYZE", "PRAGMA optimize"],
    );
    spawn_cron_statements(pool, settings.vacuum_cron.clone(), "vacuum", &["VACUUM"]);
}

/// Spawn a loop executing a statement sequence on a cron schedule.
fn spawn_cron_statements(
    pool: SqlitePool,
    cron_expr: String,
    label: &'static str,
    statements: &'static [&'static str],
) {
    let schedule = match cron::Schedule::from_str(&cron_expr) {
        Ok(s) => s,
        Err(e) => {
            warn!(task = label, cron = %cron_expr, error = %e, "invalid cron expression, maintenance loop disabled");
            return;
        }
    };

    tokio::spawn(async move {
        loop {
            let now = chrono::Utc::now();
            let Some(next) = schedule.after(&now).next() else {
                warn!(task = label, "cron schedule yields no future trigger, stopping");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::from_secs(60));
            tokio::time::sleep(wait).await;

            for sql in statements {
                match sqlx::query(sql).execute(&pool).await {
                    Ok(_) => debug!(task = label, sql, "maintenance statement completed"),
                    Err(e) => warn!(task = label, sql, error = %e, "maintenance statement failed"),
                }
            }
        }
    });
}
