//! SQLite database module for roadmap storage
//!
//! ## Architecture
//!
//! - Diesel over an r2d2 pool of SQLite connections
//! - Repositories (`careers`, `steps`, `progress`) are free functions over
//!   `&mut SqliteConnection`; services own transactions and locking
//! - Writes run in `BEGIN IMMEDIATE` transactions so concurrent writers
//!   queue on the busy timeout instead of failing on lock upgrade
//!
//! ## Tables
//!
//! - `careers` - Careers with step count, ordering epoch, global resources
//! - `roadmap_steps` - Steps, unique on `(career_id, order_index)`
//! - `user_career_progress` - Per-user progress cache, unique on `(user_id, career_id)`

pub mod careers;
pub mod diesel_schema;
pub mod models;
pub mod progress;
pub mod schema;
pub mod steps;

use std::path::Path;
use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::StorageError;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type PooledConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection PRAGMAs applied when r2d2 opens a connection
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    busy_timeout_ms: u32,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// SQLite database for careers, steps and progress
#[derive(Clone)]
pub struct RoadmapDb {
    pool: DbPool,
}

impl RoadmapDb {
    /// Open or create the database described by `config`
    pub fn open(config: &Config) -> Result<Self, StorageError> {
        let db_path = config.database_path();
        info!("Opening SQLite database at {:?}", db_path);

        Self::open_path(&db_path, config.pool_size, config.busy_timeout_ms)
    }

    /// Open or create a database file with an explicit pool size
    pub fn open_path(db_path: &Path, pool_size: u32, busy_timeout_ms: u32) -> Result<Self, StorageError> {
        let url = db_path
            .to_str()
            .ok_or_else(|| StorageError::Config(format!("Non UTF-8 database path: {:?}", db_path)))?;

        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(Duration::from_millis(u64::from(busy_timeout_ms).max(1000)))
            .connection_customizer(Box::new(ConnectionOptions { busy_timeout_ms }))
            .build(manager)?;

        let db = Self { pool };

        // WAL is persistent on the file; readers no longer block the writer
        db.conn()?
            .batch_execute("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StorageError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    ///
    /// Every `:memory:` connection is a separate database, so the pool is
    /// pinned to a single connection.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        debug!("Opening in-memory SQLite database");

        let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
        let pool = Pool::builder()
            .max_size(1)
            .connection_customizer(Box::new(ConnectionOptions { busy_timeout_ms: 5000 }))
            .build(manager)?;

        let db = Self { pool };
        db.init_schema()?;

        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        schema::init_schema(&mut conn)
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<PooledConn, StorageError> {
        Ok(self.pool.get()?)
    }

    /// Run a read-only operation on a pooled connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, StorageError>,
    {
        let mut conn = self.conn()?;
        f(&mut conn)
    }

    /// Run a write operation inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// Any error returned by `f` rolls the whole transaction back.
    pub fn write_tx<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, StorageError>,
    {
        let mut conn = self.conn()?;
        conn.immediate_transaction(f)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, StorageError> {
        self.with_conn(|conn| {
            use crate::db::diesel_schema::{careers, roadmap_steps, user_career_progress};

            let career_count: i64 = careers::table
                .count()
                .get_result(conn)
                .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?;

            let step_count: i64 = roadmap_steps::table
                .count()
                .get_result(conn)
                .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?;

            let progress_count: i64 = user_career_progress::table
                .count()
                .get_result(conn)
                .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?;

            Ok(DbStats {
                career_count: career_count as u64,
                step_count: step_count as u64,
                progress_count: progress_count as u64,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub career_count: u64,
    pub step_count: u64,
    pub progress_count: u64,
}

// Re-exports
pub use models::{
    AppliesTo, Career, FreezeMarker, GlobalResource, Resource, ResourceCategory, ResourceEntry,
    ResourceLists, RoadmapStep, UserCareerProgress,
};
