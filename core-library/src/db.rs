//! # Library Database
//!
//! Opens the SQLite file holding books, chapters, reading history and
//! persisted download jobs, and applies the embedded migrations.
//!
//! Merges and content saves each run in their own transaction while the
//! sync engine and the download workers write concurrently, so file
//! databases use WAL journaling and wait on a busy writer instead of
//! failing with `SQLITE_BUSY`.
//!
//! ```rust,ignore
//! use core_library::db::{create_pool, DatabaseConfig};
//!
//! let pool = create_pool(DatabaseConfig::for_path("library.db")).await?;
//! let store = SqliteLocalStore::new(pool, clock);
//! ```
//!
//! Every connection to `:memory:` opens its own database, so an in-memory
//! pool holds exactly one connection. Tests use [`create_test_pool`].

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, warn};

use crate::{LibraryError, Result};

const MEMORY_PATH: &str = ":memory:";

/// How long a writer waits for the lock held by another transaction
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    /// Database at `path`; the special path `:memory:` selects a private
    /// in-memory database.
    pub fn for_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if path.as_os_str() == MEMORY_PATH {
            return Self::in_memory();
        }

        Self {
            database_url: format!("sqlite:{}", path.display()),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_url == "sqlite::memory:"
    }

    /// Size the pool, typically one connection per download worker plus
    /// room for refresh cycles. In-memory databases stay at one connection.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        if !self.is_in_memory() {
            self.max_connections = max.max(1);
        }
        self
    }
}

/// Open the pool, run migrations and check the connection.
pub async fn create_pool(config: DatabaseConfig) -> Result<Pool<Sqlite>> {
    info!(
        database_url = %config.database_url,
        max_connections = config.max_connections,
        "Opening library database"
    );

    let connect_options = SqliteConnectOptions::from_str(&config.database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .create_if_missing(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect_options)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to open library database");
            LibraryError::Database(e)
        })?;

    sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
        warn!(error = %e, "Migration failed");
        LibraryError::Migration(e.to_string())
    })?;

    health_check(&pool).await?;
    debug!(connections = pool.size(), "Library database ready");
    Ok(pool)
}

/// Migrated in-memory database
pub async fn create_test_pool() -> Result<Pool<Sqlite>> {
    create_pool(DatabaseConfig::in_memory()).await
}

async fn health_check(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query("SELECT 1").fetch_one(pool).await?;
    Ok(())
}
