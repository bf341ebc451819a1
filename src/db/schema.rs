use rusqlite::Connection;
use tracing::{debug, info};

use super::{Database, OpContext, StoreResult};

/// Bumped whenever a statement below changes shape.
pub const SCHEMA_VERSION: i64 = 1;

const TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS message_checkpoints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        channel_id TEXT NOT NULL,
        thread_id TEXT,
        last_message_id TEXT NOT NULL,
        last_seen_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS thread_ownerships (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        thread_id TEXT NOT NULL UNIQUE,
        original_user_id TEXT NOT NULL,
        created_by TEXT NOT NULL,
        creation_time INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS configurations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        \"key\" TEXT NOT NULL UNIQUE,
        value TEXT NOT NULL,
        \"type\" TEXT NOT NULL,
        category TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
];

// SQLite treats NULLs as distinct in UNIQUE constraints, so the checkpoint
// natural key is enforced on IFNULL(thread_id, '') instead of a table constraint.
const INDEXES: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_checkpoints_context
        ON message_checkpoints (channel_id, IFNULL(thread_id, ''))",
    "CREATE INDEX IF NOT EXISTS idx_checkpoints_channel_thread
        ON message_checkpoints (channel_id, thread_id)",
    "CREATE INDEX IF NOT EXISTS idx_checkpoints_last_seen
        ON message_checkpoints (last_seen_at)",
    "CREATE INDEX IF NOT EXISTS idx_ownerships_thread
        ON thread_ownerships (thread_id)",
    "CREATE INDEX IF NOT EXISTS idx_ownerships_creation_time
        ON thread_ownerships (creation_time)",
    "CREATE INDEX IF NOT EXISTS idx_configurations_category
        ON configurations (category)",
    "CREATE INDEX IF NOT EXISTS idx_configurations_key_category
        ON configurations (\"key\", category)",
];

impl Database {
    /// Creates tables and indexes. Safe to run on every startup; a failure
    /// here should abort the process.
    pub async fn initialize_schema(&self, ctx: &OpContext) -> StoreResult<()> {
        info!("Database: Initializing schema...");
        self.execute(ctx, "initialize schema", apply_schema).await?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }
}

fn apply_schema(conn: &mut Connection) -> StoreResult<()> {
    let tx = conn.transaction()?;
    for statement in TABLES.iter().chain(INDEXES) {
        tx.execute(statement, [])?;
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

pub fn schema_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}
