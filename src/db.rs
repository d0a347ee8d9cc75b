//! SQLite-backed persistent store.
//!
//! Users, balances, the append-only transaction log, and provider counters
//! share one database file. A single serialized connection is enough here:
//! every ledger operation is a short transaction, and serializing them is
//! what makes the settlement's debit/credit/insert group atomic.

use anyhow::Context;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Connection tuning for on-disk databases. WAL keeps balance reads from
/// blocking behind settlement writes.
const PRAGMAS: &[(&str, &str)] = &[
    ("journal_mode", "WAL"),
    ("synchronous", "NORMAL"),
    ("foreign_keys", "ON"),
    ("busy_timeout", "5000"),
];

/// Handle to the broker's store. Cheap to clone; every clone shares the
/// same serialized connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and bring the schema up to date.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening database at {}", path.display()))?;
        for (pragma, value) in PRAGMAS {
            conn.pragma_update(None, pragma, value)
                .with_context(|| format!("setting PRAGMA {pragma}"))?;
        }
        Self::from_connection(conn)
    }

    /// Ephemeral in-memory database, used by the test suite.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA).context("applying schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection.
    ///
    /// The mutex serializes all access; a poisoned lock is recovered rather
    /// than propagated, since SQLite's own transactionality keeps the data
    /// consistent even if a caller panicked mid-closure.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let guard = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    role            TEXT NOT NULL DEFAULT 'member' CHECK (role IN ('admin', 'member')),
    status          TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'suspended')),
    api_key_hash    TEXT NOT NULL UNIQUE,
    key_prefix      TEXT NOT NULL,
    email_verified  INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_users_key_hash ON users(api_key_hash);

CREATE TABLE IF NOT EXISTS balances (
    user_id     TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
    mule        REAL NOT NULL DEFAULT 0.0,
    updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS transactions (
    id                 TEXT PRIMARY KEY,
    kind               TEXT NOT NULL CHECK (kind IN ('consumption', 'self_service', 'deposit', 'withdrawal')),
    consumer_id        TEXT NOT NULL REFERENCES users(id),
    provider_id        TEXT,
    model              TEXT NOT NULL DEFAULT '',
    tier               TEXT NOT NULL DEFAULT '',
    prompt_tokens      INTEGER NOT NULL DEFAULT 0,
    completion_tokens  INTEGER NOT NULL DEFAULT 0,
    total_tokens       INTEGER NOT NULL DEFAULT 0,
    mule_amount        REAL NOT NULL DEFAULT 0.0,
    platform_fee       REAL NOT NULL DEFAULT 0.0,
    duration_seconds   REAL NOT NULL DEFAULT 0.0,
    tokens_per_second  REAL NOT NULL DEFAULT 0.0,
    metadata           TEXT,
    created_at         TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_tx_consumer ON transactions(consumer_id);
CREATE INDEX IF NOT EXISTS idx_tx_provider ON transactions(provider_id);
CREATE INDEX IF NOT EXISTS idx_tx_created ON transactions(created_at);

CREATE TABLE IF NOT EXISTS providers (
    user_id                TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
    total_requests         INTEGER NOT NULL DEFAULT 0,
    successful_requests    INTEGER NOT NULL DEFAULT 0,
    total_tokens           INTEGER NOT NULL DEFAULT 0,
    max_tokens_per_second  REAL NOT NULL DEFAULT 0.0,
    last_active            TEXT
);
"#;
