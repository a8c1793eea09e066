use rusqlite::types::Value;
use rusqlite::{Connection, Statement as SqliteStatement, params_from_iter};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::Context;
use crate::options::DatabaseOption;
use crate::pool::{Interrupter, PoolStats, PooledConnection, SqlitePool};
use crate::result::{Cursor, Frame, QueryResult, collect_statement, scan_statement};
use crate::statement::Statement;
use crate::transaction::Transaction;
use crate::{Error, Result};

/// Rows buffered between a query producer and its cursor.
const ROW_BUFFER: usize = 64;

/// Run `f` on the blocking pool, bounded by `ctx`.
///
/// When the context fires first, the statement running under `interrupter`
/// is interrupted and the context error is returned; the blocking task winds
/// down on its own.
pub(crate) async fn run_blocking<T, F>(ctx: &Context, interrupter: Interrupter, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::task::spawn_blocking(f);
    let outcome = ctx.run(async move { task.await? }).await;
    if outcome.as_ref().is_err_and(Error::is_context_error) {
        interrupter.interrupt();
    }
    outcome
}

/// Prepare `sql`, through the connection's statement cache when `cached`.
pub(crate) fn with_statement<T, F>(conn: &Connection, sql: &str, cached: bool, f: F) -> rusqlite::Result<T>
where
    F: FnOnce(&mut SqliteStatement<'_>) -> rusqlite::Result<T>,
{
    if cached {
        let mut stmt = conn.prepare_cached(sql)?;
        f(&mut *stmt)
    } else {
        let mut stmt = conn.prepare(sql)?;
        f(&mut stmt)
    }
}

/// Execute a statement, returning rows affected and the last inserted rowid.
pub(crate) fn execute(conn: &Connection, sql: &str, args: &[Value], cached: bool) -> rusqlite::Result<(u64, i64)> {
    let affected = with_statement(conn, sql, cached, |stmt| stmt.execute(params_from_iter(args.iter())))?;
    Ok((affected as u64, conn.last_insert_rowid()))
}

/// Run a query to completion on `conn`, keeping the rows in memory.
pub(crate) fn collect(conn: &Connection, sql: &str, args: &[Value], cached: bool) -> rusqlite::Result<Cursor> {
    with_statement(conn, sql, cached, |stmt| collect_statement(stmt, args))
}

fn preview(sql: &str) -> String {
    sql.chars().take(100).collect()
}

/// An opened connection pool to one database endpoint.
///
/// Cloning is cheap and every clone shares the same pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    config: Arc<Config>,
    id: Arc<str>,
}

impl Database {
    /// Open a database from `config`.
    ///
    /// Connections are opened lazily. With `ping_on_startup` set, a ping
    /// bounded by the dial timeout runs right away and a failure closes the
    /// pool and fails the open.
    pub async fn open(config: Config) -> Result<Self> {
        let db = Database {
            pool: SqlitePool::new(&config),
            id: config.uniq_id().into(),
            config: Arc::new(config),
        };

        if db.config.ping_on_startup {
            let ctx = Context::with_timeout(db.config.dial_timeout());
            if let Err(e) = db.ping(&ctx).await {
                warn!("Startup ping to {} failed: {}", db.id, e);
                if let Err(close_err) = db.pool.close() {
                    debug!("Closing {} after failed ping: {}", db.id, close_err);
                }
                return Err(e);
            }
        }

        info!("Opened database {} ({})", db.id, db.config.format_dsn());
        Ok(db)
    }

    /// Open a database from connection parameters and options applied to
    /// the default configuration.
    pub async fn connect<I>(
        addr: impl Into<String>,
        db_name: impl Into<String>,
        user: impl Into<String>,
        passwd: impl Into<String>,
        opts: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = DatabaseOption>,
    {
        Self::open(Config::new(addr, db_name, user, passwd).with_options(opts)).await
    }

    /// Stable identifier, `net://addr/db_name`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn with_connection<T, F>(&self, ctx: &Context, f: F) -> Result<T>
    where
        F: FnOnce(&mut PooledConnection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = ctx.run(self.pool.acquire()).await?;
        let interrupter = conn.interrupter();
        run_blocking(ctx, interrupter, move || Ok(f(&mut conn)?)).await
    }

    /// Executes a query that returns rows, typically a SELECT.
    pub async fn query(&self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        self.query_with_context(&Context::background(), sql, args).await
    }

    /// Executes a query that returns rows, bounded by `ctx` and the read
    /// timeout.
    ///
    /// Rows stream from a pooled connection that stays checked out until the
    /// result is consumed, closed or dropped.
    pub async fn query_with_context(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<QueryResult> {
        self.query_inner(ctx, sql.to_owned(), args.to_vec(), false).await
    }

    pub(crate) async fn query_inner(
        &self,
        ctx: &Context,
        sql: String,
        args: Vec<Value>,
        cached: bool,
    ) -> Result<QueryResult> {
        let ctx = ctx.clone().timeout(self.config.read_timeout());
        let conn = ctx.run(self.pool.acquire()).await?;
        let interrupter = conn.interrupter();
        debug!("Query on {}: {}", self.id, preview(&sql));

        let (tx, mut rx) = mpsc::channel(ROW_BUFFER);
        let producer = tokio::task::spawn_blocking(move || {
            let scanned = with_statement(&conn, &sql, cached, |stmt| {
                scan_statement(stmt, &args, |frame| tx.blocking_send(frame).is_ok())
            });
            // back to the pool before the caller hears about the failure
            drop(conn);
            if let Err(e) = scanned {
                let _ = tx.blocking_send(Frame::Failed(e));
            }
        });

        let first = ctx.run(async { Ok(rx.recv().await) }).await;
        match first {
            Ok(Some(Frame::Columns(columns))) => {
                Ok(QueryResult::from_rows(self.id(), Cursor::streaming(columns, rx)))
            }
            Ok(Some(Frame::Failed(e))) => Err(e.into()),
            Ok(_) => {
                // producer exited without reporting anything
                producer.await?;
                Err(Error::Closed)
            }
            Err(e) => {
                interrupter.interrupt();
                Err(e)
            }
        }
    }

    /// Executes a statement without returning rows.
    pub async fn exec(&self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        self.exec_with_context(&Context::background(), sql, args).await
    }

    /// Executes a statement without returning rows, bounded by `ctx` and the
    /// write timeout.
    pub async fn exec_with_context(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<QueryResult> {
        self.exec_inner(ctx, sql.to_owned(), args.to_vec(), false).await
    }

    pub(crate) async fn exec_inner(
        &self,
        ctx: &Context,
        sql: String,
        args: Vec<Value>,
        cached: bool,
    ) -> Result<QueryResult> {
        let ctx = ctx.clone().timeout(self.config.write_timeout());
        debug!("Exec on {}: {}", self.id, preview(&sql));

        let (rows_affected, last_insert_id) = self
            .with_connection(&ctx, move |conn| execute(conn, &sql, &args, cached))
            .await?;
        Ok(QueryResult::from_outcome(self.id(), rows_affected, last_insert_id))
    }

    /// Creates a prepared statement for later queries or executions.
    pub async fn prepare(&self, sql: &str) -> Result<Statement> {
        self.prepare_with_context(&Context::background(), sql).await
    }

    /// Creates a prepared statement. `ctx` bounds the preparation only, not
    /// later executions.
    pub async fn prepare_with_context(&self, ctx: &Context, sql: &str) -> Result<Statement> {
        let text = sql.to_owned();
        self.with_connection(ctx, move |conn| conn.prepare_cached(&text).map(|_| ()))
            .await?;
        Ok(Statement::for_database(self.clone(), sql))
    }

    /// Starts a transaction on one pooled connection.
    pub async fn begin_transaction(&self) -> Result<Transaction> {
        self.begin_transaction_with_context(&Context::background()).await
    }

    /// Starts a transaction. `ctx` bounds the BEGIN only.
    pub async fn begin_transaction_with_context(&self, ctx: &Context) -> Result<Transaction> {
        let conn = ctx.run(self.pool.acquire()).await?;
        Transaction::begin(ctx, self.id.clone(), &self.config, conn).await
    }

    /// Verifies a connection to the database is still alive, establishing
    /// one if necessary.
    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        self.with_connection(ctx, |conn| conn.query_row("SELECT 1", [], |_| Ok(())))
            .await
    }

    /// Number of connections currently in use.
    pub fn active_connections(&self) -> usize {
        self.pool.stats().active
    }

    /// Number of idle connections.
    pub fn idle_connections(&self) -> usize {
        self.pool.stats().idle
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Closes the database and prevents new queries from starting.
    ///
    /// Connections still in use are closed as they are released.
    pub fn close(&self) -> Result<()> {
        info!("Closing database {}", self.id);
        self.pool.close()
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("stats", &self.pool.stats())
            .finish()
    }
}
