//! Database schema definitions

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::Integer;
use tracing::info;

use crate::error::StorageError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

#[derive(QueryableByName)]
struct VersionRow {
    #[diesel(sql_type = Integer)]
    version: i32,
}

/// Initialize the database schema
pub fn init_schema(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        conn.batch_execute(ROADMAP_SCHEMA)
            .map_err(|e| StorageError::Internal(format!("Failed to create tables: {}", e)))?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &mut SqliteConnection) -> Result<i32, StorageError> {
    conn.batch_execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .map_err(|e| StorageError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let row: Option<VersionRow> = diesel::sql_query("SELECT version FROM schema_version LIMIT 1")
        .get_result(conn)
        .optional()
        .map_err(|e| StorageError::Internal(format!("Failed to read schema_version: {}", e)))?;

    Ok(row.map(|r| r.version).unwrap_or(0))
}

/// Set schema version
fn set_schema_version(conn: &mut SqliteConnection, version: i32) -> Result<(), StorageError> {
    conn.batch_execute(&format!(
        "DELETE FROM schema_version; INSERT INTO schema_version (version) VALUES ({});",
        version
    ))
    .map_err(|e| StorageError::Internal(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

/// Careers, steps and per-user progress.
///
/// `idx_steps_career_order` is the load-bearing constraint: SQLite checks it
/// row by row during an UPDATE, so bulk renumbering goes through the
/// displacement technique in `db::steps`.
const ROADMAP_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS careers (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    steps_count INTEGER NOT NULL DEFAULT 0,
    order_epoch BIGINT NOT NULL DEFAULT 0,
    courses_json TEXT NOT NULL DEFAULT '[]',
    playlists_json TEXT NOT NULL DEFAULT '[]',
    books_json TEXT NOT NULL DEFAULT '[]',
    frozen_at TEXT,
    frozen_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_careers_title ON careers(title);

CREATE TABLE IF NOT EXISTS roadmap_steps (
    id TEXT PRIMARY KEY NOT NULL,
    career_id TEXT NOT NULL REFERENCES careers(id) ON DELETE CASCADE,
    order_index INTEGER NOT NULL CHECK (order_index > 0),
    title TEXT NOT NULL,
    description TEXT,
    courses_json TEXT NOT NULL DEFAULT '[]',
    playlists_json TEXT NOT NULL DEFAULT '[]',
    books_json TEXT NOT NULL DEFAULT '[]',
    allow_global_resources BOOLEAN NOT NULL DEFAULT 1,
    frozen_at TEXT,
    frozen_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_steps_career_order ON roadmap_steps(career_id, order_index);
CREATE UNIQUE INDEX IF NOT EXISTS idx_steps_career_title ON roadmap_steps(career_id, title);

CREATE TABLE IF NOT EXISTS user_career_progress (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    career_id TEXT NOT NULL REFERENCES careers(id) ON DELETE CASCADE,
    completed_steps_json TEXT NOT NULL DEFAULT '[]',
    in_progress_step TEXT,
    next_step TEXT,
    frontier_step TEXT,
    percentage_completed DOUBLE NOT NULL DEFAULT 0,
    order_epoch BIGINT NOT NULL DEFAULT 0,
    version BIGINT NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_progress_user_career ON user_career_progress(user_id, career_id);
CREATE INDEX IF NOT EXISTS idx_progress_career ON user_career_progress(career_id);
"#;
