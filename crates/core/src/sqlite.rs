//! SQLite plumbing shared by the ledger, batch store and marketplace store.
//!
//! All stores open their database in WAL mode so readers never block the
//! single writer, and classify `SQLITE_BUSY`/`SQLITE_LOCKED` as an
//! optimistic-concurrency conflict rather than a storage failure.

use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Open (creating if needed) a database with WAL journaling.
pub fn open_connection(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            // Surface directory failures through SQLite's own open error
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(busy_timeout)?;

    Ok(conn)
}

/// True for lock contention errors, including WAL snapshot conflicts.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

/// True when a UNIQUE or PRIMARY KEY constraint rejected a write.
pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Small checkout pool: each unit of work gets its own connection so
/// transactions for different vehicles proceed independently.
pub struct ConnectionPool {
    path: PathBuf,
    busy_timeout: Duration,
    max_idle: usize,
    idle: Mutex<Vec<Connection>>,
}

impl ConnectionPool {
    /// Open the pool and run `init` once on the first connection.
    pub fn open<F>(
        path: impl AsRef<Path>,
        max_idle: usize,
        busy_timeout: Duration,
        init: F,
    ) -> rusqlite::Result<Self>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<()>,
    {
        let path = path.as_ref().to_path_buf();
        let first = open_connection(&path, busy_timeout)?;
        init(&first)?;

        info!(path = %path.display(), max_idle, "Opened connection pool");

        Ok(Self {
            path,
            busy_timeout,
            max_idle: max_idle.max(1),
            idle: Mutex::new(vec![first]),
        })
    }

    /// Check out a connection, opening a new one when none is idle.
    pub fn get(&self) -> rusqlite::Result<PooledConnection<'_>> {
        let cached = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();

        let conn = match cached {
            Some(conn) => conn,
            None => {
                debug!(path = %self.path.display(), "Opening additional pooled connection");
                open_connection(&self.path, self.busy_timeout)?
            }
        };

        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn give_back(&self, conn: Connection) {
        let mut idle = self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }
}

/// Connection checked out of a [`ConnectionPool`]; returned on drop.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}
