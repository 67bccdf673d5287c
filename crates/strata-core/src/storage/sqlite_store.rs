//! SQLite backend shared by every agent of the process
//!
//! All agents write to one WAL-mode database through one connection. The
//! connection's mutex is the process-wide backend lock: it is taken around raw
//! delta reads and writes only, never around identity bookkeeping.
//!
//! ```text
//! deltas            (agent, delta) → payload BLOB
//! sequence_numbers  agent → (first, current)
//! ```

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::io::{self, Cursor, Write};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use crate::error::{PersistenceError, Result, ResultExt};
use crate::storage::DeltaStore;
use crate::types::SequenceNumbers;

/// Handle on the shared database for one agent
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    agent: String,
}

/// Delta buffered in memory until commit
#[derive(Debug)]
pub struct SqliteOutput {
    delta: u32,
    buffer: Vec<u8>,
}

impl Write for SqliteOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path` in WAL mode
    pub fn open(path: impl AsRef<Path>, agent: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Creating database directory '{}'", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Opening SQLite '{}'", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("Configuring SQLite WAL pragmas")?;

        Self::with_connection(conn, agent)
    }

    /// Private in-memory database, mainly for tests
    pub fn open_in_memory(agent: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, agent)
    }

    fn with_connection(conn: Connection, agent: impl Into<String>) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            agent: agent.into(),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Another agent's handle on the same database and lock
    pub fn for_agent(&self, agent: impl Into<String>) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            agent: agent.into(),
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Idempotent schema migration
    fn migrate(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS deltas (
                agent        TEXT NOT NULL,
                delta        INTEGER NOT NULL,
                payload      BLOB NOT NULL,
                saved_at_ms  INTEGER NOT NULL,
                PRIMARY KEY (agent, delta)
            );

            CREATE TABLE IF NOT EXISTS sequence_numbers (
                agent          TEXT PRIMARY KEY,
                first          INTEGER NOT NULL,
                current        INTEGER NOT NULL,
                updated_at_ms  INTEGER NOT NULL
            );
            ",
            )
            .context("Migrating SQLite schema")?;
        Ok(())
    }

    /// Agents with committed state in this database
    pub fn agents(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT agent FROM sequence_numbers ORDER BY agent")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .context("Listing agents")
    }
}

impl DeltaStore for SqliteStore {
    type Output = SqliteOutput;
    type Input = Cursor<Vec<u8>>;

    fn read_sequence_numbers(&self) -> Result<Option<SequenceNumbers>> {
        let result = self.conn.lock().query_row(
            "SELECT first, current FROM sequence_numbers WHERE agent = ?1",
            params![self.agent],
            |row| Ok((row.get::<_, u32>(0)?, row.get::<_, u32>(1)?)),
        );

        match result {
            Ok((first, current)) if first <= current => {
                Ok(Some(SequenceNumbers::new(first, current)))
            }
            Ok((first, current)) => Err(PersistenceError::InvalidConfig(format!(
                "sequence numbers of agent {} have first {} > current {}",
                self.agent, first, current
            ))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Query sequence_numbers"),
        }
    }

    fn open_output(&self, delta: u32) -> Result<Self::Output> {
        Ok(SqliteOutput {
            delta,
            buffer: Vec::new(),
        })
    }

    fn close_output(&self, retain: SequenceNumbers, output: Self::Output) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO deltas (agent, delta, payload, saved_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![self.agent, output.delta, output.buffer, now],
        )
        .context("INSERT deltas")?;
        tx.execute(
            "INSERT INTO sequence_numbers (agent, first, current, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(agent) DO UPDATE SET
                first = excluded.first,
                current = excluded.current,
                updated_at_ms = excluded.updated_at_ms",
            params![self.agent, retain.first, retain.current, now],
        )
        .context("UPSERT sequence_numbers")?;
        tx.commit()?;
        Ok(())
    }

    fn abort_output(&self, _retain: SequenceNumbers, output: Self::Output) -> Result<()> {
        tracing::debug!(agent = %self.agent, delta = output.delta, "Discarding aborted delta");
        Ok(())
    }

    fn open_input(&self, delta: u32) -> Result<Self::Input> {
        let payload: Option<Vec<u8>> = self
            .conn
            .lock()
            .query_row(
                "SELECT payload FROM deltas WHERE agent = ?1 AND delta = ?2",
                params![self.agent, delta],
                |row| row.get(0),
            )
            .optional()
            .context("Query deltas")?;
        payload
            .map(Cursor::new)
            .ok_or(PersistenceError::DeltaNotFound(delta))
    }

    fn cleanup_deltas(&self, range: Range<u32>) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM deltas WHERE agent = ?1 AND delta >= ?2 AND delta < ?3",
                params![self.agent, range.start, range.end],
            )
            .context("DELETE deltas range")?;
        Ok(())
    }

    fn delete_all(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM deltas WHERE agent = ?1", params![self.agent])?;
        tx.execute(
            "DELETE FROM sequence_numbers WHERE agent = ?1",
            params![self.agent],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_deltas(&self) -> Result<Vec<u32>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT delta FROM deltas WHERE agent = ?1 ORDER BY delta")?;
        let rows = stmt.query_map(params![self.agent], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<u32>>>()
            .context("Listing deltas")
    }
}
