use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use crate::db;
use crate::error::Result;

/// Thread-safe handle to the CachiBot database.
///
/// Wraps a single SQLite connection in a `Mutex`. A connection pool would
/// scale further, but one connection is sufficient for the single-node
/// target, and SQLite serialises writers anyway.
pub struct Store {
    pub(crate) db: Mutex<Connection>,
}

impl Store {
    /// Open (and initialise) the database at `path`, creating parent
    /// directories as needed.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(dir) = Path::new(path).parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        db::init_db(&conn)?;
        info!(path = %path, "database ready");
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}
