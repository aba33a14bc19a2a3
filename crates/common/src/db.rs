//! SQLite database for tunnel inventory persistence

use crate::Result;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Database wrapper shared across the broker
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Expose the underlying connection for subsystems that run their own
    /// queries and transactions against the shared state DB.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Tunnel inventory
            CREATE TABLE IF NOT EXISTS tunnels (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                server_ipv4 TEXT NOT NULL,
                client_ipv4 TEXT NOT NULL,
                endpoint_local TEXT NOT NULL,
                endpoint_remote TEXT NOT NULL,
                delegated_prefix_1 TEXT NOT NULL,
                delegated_prefix_2 TEXT NOT NULL,
                delegated_prefix_3 TEXT,
                server_public_key TEXT,
                client_private_key TEXT,
                client_public_key TEXT,
                listen_port INTEGER,
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tunnels_user ON tunnels(user_id);
            CREATE INDEX IF NOT EXISTS idx_tunnels_status ON tunnels(status);

            -- Per-user tunnel counters
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                created_tunnels INTEGER NOT NULL DEFAULT 0,
                active_tunnels INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory_initializes_schema() {
        let db = Database::open_memory().unwrap();
        let conn = db.connection();
        let conn = conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tunnels", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
