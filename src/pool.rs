use parking_lot::Mutex;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::Config;
use crate::{Error, Result};

const FILE_PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA cache_size=-64000;
     PRAGMA temp_store=MEMORY;";

const MEMORY_PRAGMAS: &str = "PRAGMA cache_size=-64000;
     PRAGMA temp_store=MEMORY;";

struct IdleConnection {
    conn: Connection,
    created_at: Instant,
}

struct PoolShared {
    target: String,
    memory: bool,
    busy_timeout: Duration,
    idle: Mutex<Vec<IdleConnection>>,
    /// Keeps a shared-cache memory database alive while pooled connections
    /// come and go. Never handed out.
    anchor: Mutex<Option<Connection>>,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    max_open: usize,
    max_idle: usize,
    max_lifetime: Duration,
}

impl PoolShared {
    fn connect(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;

        let conn = Connection::open_with_flags(&self.target, flags)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch(if self.memory { MEMORY_PRAGMAS } else { FILE_PRAGMAS })?;
        Ok(conn)
    }

    /// Blocking; call from the blocking pool.
    fn open(&self) -> Result<Connection> {
        if self.memory {
            let mut anchor = self.anchor.lock();
            // close() takes the anchor; do not resurrect it afterwards
            if self.semaphore.is_closed() {
                return Err(Error::Closed);
            }
            if anchor.is_none() {
                *anchor = Some(self.connect()?);
                debug!("Anchored memory database {}", self.target);
            }
        }

        let conn = self.connect()?;
        debug!("Opened new connection to {}", self.target);
        Ok(conn)
    }

    fn is_expired(&self, created_at: Instant) -> bool {
        !self.max_lifetime.is_zero() && created_at.elapsed() >= self.max_lifetime
    }

    fn take_idle(&self) -> Option<IdleConnection> {
        let mut idle = self.idle.lock();
        while let Some(candidate) = idle.pop() {
            if self.is_expired(candidate.created_at) {
                close_quietly(&self.target, candidate.conn);
                continue;
            }
            return Some(candidate);
        }
        None
    }

    fn release(&self, conn: Connection, created_at: Instant) {
        self.active.fetch_sub(1, Ordering::AcqRel);

        if self.is_expired(created_at) {
            close_quietly(&self.target, conn);
            return;
        }

        let mut idle = self.idle.lock();
        // checked under the idle lock so close() cannot miss this connection
        if self.semaphore.is_closed() || idle.len() >= self.max_idle {
            drop(idle);
            close_quietly(&self.target, conn);
            return;
        }
        idle.push(IdleConnection { conn, created_at });
    }
}

fn close_quietly(target: &str, conn: Connection) {
    if let Err((_, e)) = conn.close() {
        warn!("Failed to close connection to {}: {}", target, e);
    }
}

/// Pool occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections currently handed out
    pub active: usize,
    /// Connections parked for reuse
    pub idle: usize,
    /// Zero means unlimited
    pub max_open: usize,
    pub max_idle: usize,
}

/// SQLite connection pool bounded by a semaphore.
///
/// Connections are opened lazily on first use and parked in an idle list
/// when released, up to `max_idle_conns`. Connections older than
/// `max_lifetime` are closed instead of reused.
#[derive(Clone)]
pub struct SqlitePool {
    shared: Arc<PoolShared>,
}

impl SqlitePool {
    pub fn new(config: &Config) -> Self {
        let permits = if config.max_open_conns == 0 {
            Semaphore::MAX_PERMITS
        } else {
            config.max_open_conns
        };

        SqlitePool {
            shared: Arc::new(PoolShared {
                target: config.target(),
                memory: config.params.is_memory(),
                busy_timeout: config.busy_timeout(),
                idle: Mutex::new(Vec::new()),
                anchor: Mutex::new(None),
                semaphore: Arc::new(Semaphore::new(permits)),
                active: AtomicUsize::new(0),
                max_open: config.max_open_conns,
                max_idle: config.max_idle_conns,
                max_lifetime: config.max_lifetime,
            }),
        }
    }

    /// Wait for a free slot and hand out a connection.
    ///
    /// Fails with [`Error::Closed`] once the pool has been closed, including
    /// for callers that were already waiting.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = self
            .shared
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)?;

        let (conn, created_at) = match self.shared.take_idle() {
            Some(idle) => (idle.conn, idle.created_at),
            None => {
                let shared = self.shared.clone();
                let conn = tokio::task::spawn_blocking(move || shared.open()).await??;
                (conn, Instant::now())
            }
        };

        self.shared.active.fetch_add(1, Ordering::AcqRel);
        let interrupt = Arc::new(Mutex::new(Some(conn.get_interrupt_handle())));

        Ok(PooledConnection {
            conn: Some(conn),
            created_at,
            pool: self.shared.clone(),
            interrupt,
            _permit: permit,
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.shared.active.load(Ordering::Acquire),
            idle: self.shared.idle.lock().len(),
            max_open: self.shared.max_open,
            max_idle: self.shared.max_idle,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.semaphore.is_closed()
    }

    /// Stop handing out connections and close every idle one.
    ///
    /// Connections in use are closed when they are released. Every idle
    /// connection is closed even if an earlier one fails; the first failure
    /// is returned. A memory database is gone once its last in-use
    /// connection is released.
    pub fn close(&self) -> Result<()> {
        self.shared.semaphore.close();

        let drained = std::mem::take(&mut *self.shared.idle.lock());
        let anchor = self.shared.anchor.lock().take();
        let mut first_err = None;
        for conn in drained.into_iter().map(|idle| idle.conn).chain(anchor) {
            if let Err((_, e)) = conn.close() {
                warn!("Failed to close connection to {}: {}", self.shared.target, e);
                first_err.get_or_insert(e);
            }
        }

        debug!("Closed pool for {}", self.shared.target);
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Interrupts whatever statement is running on one checkout of a pooled
/// connection. Disarmed when the checkout ends, so it can never reach the
/// next borrower of the same connection.
#[derive(Clone)]
pub struct Interrupter {
    handle: Arc<Mutex<Option<InterruptHandle>>>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        if let Some(handle) = self.handle.lock().as_ref() {
            handle.interrupt();
        }
    }
}

pub struct PooledConnection {
    conn: Option<Connection>,
    created_at: Instant,
    pool: Arc<PoolShared>,
    interrupt: Arc<Mutex<Option<InterruptHandle>>>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            handle: self.interrupt.clone(),
        }
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("pooled connection used after release")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled connection used after release")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.interrupt.lock().take();
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.created_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options;
    use tempfile::TempDir;

    fn file_config(dir: &TempDir) -> Config {
        Config::new(dir.path().to_string_lossy(), "pool.db", "", "")
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let pool = SqlitePool::new(&file_config(&dir));

        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().idle, 0);

        let conn = pool.acquire().await.unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
        assert_eq!(pool.stats().active, 1);

        drop(conn);
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);

        // the parked connection is reused
        let _conn = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_idle_cap() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir).with_options(vec![options::with_max_idle_conns(1)]);
        let pool = SqlitePool::new(&config);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().active, 2);

        drop(a);
        drop(b);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_expired_connections_are_not_reused() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir)
            .with_options(vec![options::with_max_conn_lifetime(Duration::from_millis(10))]);
        let pool = SqlitePool::new(&config);

        let conn = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(conn);

        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_max_open_blocks() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir).with_options(vec![options::with_max_open_conns(1)]);
        let pool = SqlitePool::new(&config);

        let held = pool.acquire().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err());

        drop(held);
        let conn = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn test_close_rejects_acquire() {
        let dir = TempDir::new().unwrap();
        let pool = SqlitePool::new(&file_config(&dir));

        let in_use = pool.acquire().await.unwrap();
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.stats().idle, 1);

        pool.close().unwrap();
        assert!(pool.is_closed());
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(pool.acquire().await, Err(Error::Closed)));

        // released after close: closed, not parked
        drop(in_use);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_interrupter_disarmed_after_release() {
        let dir = TempDir::new().unwrap();
        let pool = SqlitePool::new(&file_config(&dir));

        let conn = pool.acquire().await.unwrap();
        let interrupter = conn.interrupter();
        drop(conn);

        // the parked connection must not observe the stale interrupt
        interrupter.interrupt();
        let conn = pool.acquire().await.unwrap();
        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn test_memory_database_survives_recycling() {
        let config = Config::memory("pool_recycle").with_options(vec![
            options::with_max_idle_conns(0),
            options::with_max_conn_lifetime(Duration::from_millis(10)),
        ]);
        let pool = SqlitePool::new(&config);

        let conn = pool.acquire().await.unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
        drop(conn);
        assert_eq!(pool.stats().idle, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let conn = pool.acquire().await.unwrap();
        let count: i64 = conn.query_row("SELECT count(*) FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
        drop(conn);

        pool.close().unwrap();
        assert!(pool.shared.anchor.lock().is_none());
    }

    #[tokio::test]
    async fn test_open_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing").join("nested");
        let config = Config::new(missing.to_string_lossy(), "x.db", "", "");
        let pool = SqlitePool::new(&config);

        assert!(matches!(pool.acquire().await, Err(Error::Sqlite(_))));
        assert_eq!(pool.stats().active, 0);
    }
}
