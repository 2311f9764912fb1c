//! Process-wide cache of connections to plaintext shard files, keyed by canonical path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OpenFlags};

use crate::error::{CloseFailure, StoreError, StoreResult};

/// A cached connection. `rusqlite::Connection` is `Send` but not `Sync`, so callers serialise on
/// the mutex.
pub type SharedConnection = Arc<Mutex<Connection>>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct ConnectionCache {
    conns: RwLock<HashMap<PathBuf, SharedConnection>>,
}

impl std::fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache").field("open", &self.len()).finish()
    }
}

impl ConnectionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live connection for `path`, opening it on first use or after a failed liveness
    /// check.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when `path` does not resolve and [`StoreError::Open`] when the
    /// file cannot be opened or fails the initial liveness check. Cache state for other paths is
    /// untouched.
    pub fn get(&self, path: &Path) -> StoreResult<SharedConnection> {
        let key = fs_key(path)?;

        let cached = self.conns.read().get(&key).cloned();
        if let Some(conn) = cached {
            if is_alive(&conn) {
                return Ok(conn);
            }
        }

        // Open under the write lock: at most one live handle per path.
        let mut conns = self.conns.write();
        if let Some(conn) = conns.get(&key) {
            if is_alive(conn) {
                return Ok(conn.clone());
            }
            tracing::debug!("Evicting dead connection to {}", key.display());
            conns.remove(&key);
        }

        let conn = Arc::new(Mutex::new(open_connection(&key)?));
        conns.insert(key, conn.clone());
        Ok(conn)
    }

    /// Close and forget the cached handle for `path`. Closing a path that is not cached is a
    /// no-op.
    ///
    /// A handle still held by another caller stays cached so that a later `get` cannot open a
    /// second live handle beside it.
    ///
    /// # Errors
    /// Returns [`StoreError::InUse`] while another caller holds the handle and
    /// [`StoreError::CloseAll`] with a single entry when SQLite fails to close it.
    pub fn close(&self, path: &Path) -> StoreResult<()> {
        let key = fs_key(path).unwrap_or_else(|_| path.to_path_buf());
        let mut conns = self.conns.write();
        let Some(conn) = conns.get(&key) else {
            return Ok(());
        };
        if Arc::strong_count(conn) > 1 {
            return Err(StoreError::InUse { path: key });
        }
        let Some(conn) = conns.remove(&key) else {
            return Ok(());
        };
        drop(conns);
        close_shared(&key, conn).map_err(|failure| StoreError::CloseAll(vec![failure]))
    }

    /// Swap in an empty map, then close every previously cached handle.
    ///
    /// Handles still borrowed at shutdown are not waited for; each closes when its last holder
    /// drops it.
    ///
    /// # Errors
    /// Returns [`StoreError::CloseAll`] listing every handle that failed to close; the others
    /// are still closed.
    pub fn close_all(&self) -> StoreResult<()> {
        let drained = std::mem::take(&mut *self.conns.write());
        let failures: Vec<CloseFailure> = drained
            .into_iter()
            .filter_map(|(path, conn)| close_shared(&path, conn).err())
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StoreError::CloseAll(failures))
        }
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        fs_key(path).is_ok_and(|key| self.conns.read().contains_key(&key))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn fs_key(path: &Path) -> StoreResult<PathBuf> {
    std::fs::canonicalize(path)
        .map_err(|source| StoreError::Io { path: path.to_path_buf(), source })
}

fn open_connection(path: &Path) -> StoreResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_SHARED_CACHE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .map_err(|source| StoreError::Open { path: path.to_path_buf(), source })?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|source| StoreError::Open { path: path.to_path_buf(), source })?;
    ping(&conn).map_err(|source| StoreError::Open { path: path.to_path_buf(), source })?;
    tracing::debug!("Opened {}", path.display());
    Ok(conn)
}

fn ping(conn: &Connection) -> rusqlite::Result<()> {
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .map(|_| ())
}

/// A connection held by another caller is in use, so it counts as alive.
fn is_alive(conn: &SharedConnection) -> bool {
    conn.try_lock().map_or(true, |guard| ping(&guard).is_ok())
}

fn close_shared(path: &Path, conn: SharedConnection) -> Result<(), CloseFailure> {
    match Arc::try_unwrap(conn) {
        Ok(mutex) => mutex
            .into_inner()
            .close()
            .map_err(|(_, source)| CloseFailure { path: path.to_path_buf(), source }),
        // Still borrowed by a caller; it closes when they drop it.
        Err(_) => Ok(()),
    }
}
