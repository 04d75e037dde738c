//! Storage Module
//!
//! Shared SQLite plumbing for everything durable:
//! - Connection setup (WAL, busy timeout, foreign keys)
//! - Versioned schema migrations
//! - Platform default database location

mod migrations;

use std::path::PathBuf;

use rusqlite::Connection;

pub use migrations::{apply_migrations, get_current_version, Migration, MIGRATIONS};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

// ============================================================================
// CONNECTIONS
// ============================================================================

/// Apply PRAGMAs to a connection
///
/// WAL lets the task store's writer coexist with index readers on the
/// same file; busy_timeout covers the brief claim-time write contention.
pub fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;
         PRAGMA temp_store = MEMORY;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

/// Resolve the default database path under the platform data directory
pub fn default_db_path() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("io", "verbatim", "core").ok_or_else(|| {
        StorageError::Init("Could not determine project directories".to_string())
    })?;
    let data_dir = proj_dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;
    Ok(data_dir.join("verbatim.db"))
}

/// Open a connection, configure it, and bring the schema up to date
///
/// `None` resolves to the platform default location. Every component that
/// shares the database (keyword index, semantic index, task store) opens
/// through here so they all agree on schema and PRAGMAs.
pub fn open(db_path: Option<PathBuf>) -> Result<Connection> {
    let conn = match db_path {
        Some(path) => Connection::open(path)?,
        None => Connection::open(default_db_path()?)?,
    };
    configure_connection(&conn)?;
    apply_migrations(&conn)?;
    Ok(conn)
}
