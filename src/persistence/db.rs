// =============================================================================
// Database handle — embedded SQLite behind a single serialized connection
// =============================================================================
//
// One connection guarded by an async mutex serves the whole process. Every
// transaction is short (a single order execution or a cascade delete) and
// runs entirely inside a synchronous closure, so nothing ever holds the
// connection across an await point.
// =============================================================================

use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::CoreResult;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: &str) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        init_schema(&conn)?;
        info!(path, "database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a read-only (or single-statement) operation on the connection.
    pub async fn with_conn<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Connection) -> CoreResult<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Run `f` inside a transaction. Commits on `Ok`, rolls back on `Err`;
    /// no mutation from a failed closure is ever observable.
    pub async fn with_tx<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> CoreResult<T>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                drop(tx);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS simulations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            symbol TEXT NOT NULL,
            start_sim_time INTEGER NOT NULL,
            end_sim_time INTEGER,
            initial_funding REAL NOT NULL,
            mode TEXT NOT NULL DEFAULT 'spot',
            extra_configs TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL,
            total_value REAL,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            simulation_id INTEGER NOT NULL,
            symbol TEXT NOT NULL,
            base_currency TEXT NOT NULL,
            side TEXT NOT NULL,
            order_type TEXT NOT NULL DEFAULT 'market',
            quantity REAL NOT NULL,
            status TEXT NOT NULL,
            placed_at INTEGER NOT NULL,
            executed_at INTEGER,
            executed_price REAL,
            fee REAL NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_orders_sim ON orders(simulation_id, placed_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            simulation_id INTEGER NOT NULL,
            symbol TEXT NOT NULL,
            base_currency TEXT NOT NULL,
            side TEXT NOT NULL,
            quantity REAL NOT NULL,
            price REAL NOT NULL,
            fee REAL NOT NULL,
            executed_at INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trades_sim ON trades(simulation_id, executed_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS positions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            simulation_id INTEGER NOT NULL,
            symbol TEXT NOT NULL,
            base_currency TEXT NOT NULL,
            quantity REAL NOT NULL,
            average_price REAL NOT NULL,
            total_cost REAL NOT NULL,
            UNIQUE(user_id, simulation_id, symbol)
        )",
        [],
    )?;

    Ok(())
}
