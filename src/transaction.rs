use parking_lot::Mutex;
use rusqlite::types::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::context::Context;
use crate::database::{collect, execute, run_blocking};
use crate::pool::PooledConnection;
use crate::result::QueryResult;
use crate::statement::Statement;
use crate::{Error, Result};

type Slot = Arc<Mutex<Option<PooledConnection>>>;

/// A pooled connection pinned for the lifetime of one transaction.
///
/// The slot empties on commit or rollback; every later call fails with
/// [`Error::TransactionDone`].
#[derive(Clone)]
pub(crate) struct Pinned {
    hit: Arc<str>,
    slot: Slot,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Pinned {
    async fn call<T, F>(&self, ctx: &Context, f: F) -> Result<T>
    where
        F: FnOnce(&mut Option<PooledConnection>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let interrupter = match self.slot.lock().as_ref() {
            Some(conn) => conn.interrupter(),
            None => return Err(Error::TransactionDone),
        };
        let slot = self.slot.clone();
        run_blocking(ctx, interrupter, move || {
            let mut guard = slot.lock();
            f(&mut *guard)
        })
        .await
    }

    pub(crate) async fn query(
        &self,
        ctx: &Context,
        sql: String,
        args: Vec<Value>,
        cached: bool,
    ) -> Result<QueryResult> {
        let ctx = ctx.clone().timeout(self.read_timeout);
        // buffered, so the pinned connection is free for the next statement
        let cursor = self
            .call(&ctx, move |slot| {
                let conn = slot.as_ref().ok_or(Error::TransactionDone)?;
                Ok(collect(conn, &sql, &args, cached)?)
            })
            .await?;
        Ok(QueryResult::from_rows(&*self.hit, cursor))
    }

    pub(crate) async fn exec(
        &self,
        ctx: &Context,
        sql: String,
        args: Vec<Value>,
        cached: bool,
    ) -> Result<QueryResult> {
        let ctx = ctx.clone().timeout(self.write_timeout);
        let (rows_affected, last_insert_id) = self
            .call(&ctx, move |slot| {
                let conn = slot.as_ref().ok_or(Error::TransactionDone)?;
                Ok(execute(conn, &sql, &args, cached)?)
            })
            .await?;
        Ok(QueryResult::from_outcome(&*self.hit, rows_affected, last_insert_id))
    }

    async fn prepare(&self, ctx: &Context, sql: String) -> Result<()> {
        self.call(ctx, move |slot| {
            let conn = slot.as_ref().ok_or(Error::TransactionDone)?;
            conn.prepare_cached(&sql)?;
            Ok(())
        })
        .await
    }

    async fn finish(&self, ctx: &Context, sql: &'static str) -> Result<()> {
        let hit = self.hit.clone();
        self.call(ctx, move |slot| {
            let conn = slot.take().ok_or(Error::TransactionDone)?;
            if let Err(e) = conn.execute_batch(sql) {
                if !conn.is_autocommit() {
                    if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                        warn!("Rollback after failed {} on {} failed: {}", sql, hit, rollback_err);
                    }
                }
                return Err(e.into());
            }
            debug!("{} on {}", sql, hit);
            Ok(())
        })
        .await
    }

    fn is_done(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// A transaction bound to one connection of the primary database.
///
/// Dropping a transaction that was neither committed nor rolled back rolls
/// it back.
pub struct Transaction {
    pinned: Pinned,
}

impl Transaction {
    pub(crate) async fn begin(
        ctx: &Context,
        hit: Arc<str>,
        config: &Config,
        conn: PooledConnection,
    ) -> Result<Self> {
        let tx = Transaction {
            pinned: Pinned {
                hit,
                slot: Arc::new(Mutex::new(Some(conn))),
                read_timeout: config.read_timeout(),
                write_timeout: config.write_timeout(),
            },
        };

        // on failure, drop rolls back anything BEGIN managed to start
        tx.pinned
            .call(ctx, |slot| {
                let conn = slot.as_ref().ok_or(Error::TransactionDone)?;
                conn.execute_batch("BEGIN")?;
                Ok(())
            })
            .await?;

        debug!("BEGIN on {}", tx.pinned.hit);
        Ok(tx)
    }

    /// Id of the database the transaction runs on.
    pub fn hit(&self) -> &str {
        &self.pinned.hit
    }

    /// True once the transaction was committed or rolled back.
    pub fn is_done(&self) -> bool {
        self.pinned.is_done()
    }

    /// Executes a query that returns rows. The rows are read in full before
    /// the call returns.
    pub async fn query(&self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        self.query_with_context(&Context::background(), sql, args).await
    }

    pub async fn query_with_context(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<QueryResult> {
        self.pinned.query(ctx, sql.to_owned(), args.to_vec(), false).await
    }

    /// Executes a statement without returning rows.
    pub async fn exec(&self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        self.exec_with_context(&Context::background(), sql, args).await
    }

    pub async fn exec_with_context(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<QueryResult> {
        self.pinned.exec(ctx, sql.to_owned(), args.to_vec(), false).await
    }

    /// Creates a prepared statement that runs inside this transaction.
    pub async fn prepare(&self, sql: &str) -> Result<Statement> {
        self.prepare_with_context(&Context::background(), sql).await
    }

    pub async fn prepare_with_context(&self, ctx: &Context, sql: &str) -> Result<Statement> {
        self.pinned.prepare(ctx, sql.to_owned()).await?;
        Ok(Statement::for_transaction(self.pinned.clone(), sql))
    }

    pub async fn commit(&self) -> Result<()> {
        self.commit_with_context(&Context::background()).await
    }

    pub async fn commit_with_context(&self, ctx: &Context) -> Result<()> {
        self.pinned.finish(ctx, "COMMIT").await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.rollback_with_context(&Context::background()).await
    }

    pub async fn rollback_with_context(&self, ctx: &Context) -> Result<()> {
        self.pinned.finish(ctx, "ROLLBACK").await
    }
}

fn roll_back_abandoned(slot: &Slot, hit: &str) {
    let Some(conn) = slot.lock().take() else {
        return;
    };
    if conn.is_autocommit() {
        return;
    }
    match conn.execute_batch("ROLLBACK") {
        Ok(()) => debug!("Rolled back abandoned transaction on {}", hit),
        Err(e) => warn!("Failed to roll back abandoned transaction on {}: {}", hit, e),
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.pinned.is_done() {
            return;
        }
        let slot = self.pinned.slot.clone();
        let hit = self.pinned.hit.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || roll_back_abandoned(&slot, &hit));
            }
            Err(_) => roll_back_abandoned(&slot, &hit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> Database {
        let db = Database::connect(dir.path().to_string_lossy(), "tx.db", "", "", Vec::new())
            .await
            .unwrap();
        db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[])
            .await
            .unwrap();
        db
    }

    async fn count(db: &Database) -> String {
        let mut result = db.query("SELECT count(*) AS n FROM t", &[]).await.unwrap();
        result.row().await.unwrap()["n"].clone()
    }

    #[tokio::test]
    async fn test_commit() {
        let dir = TempDir::new().unwrap();
        let db = setup(&dir).await;

        let tx = db.begin_transaction().await.unwrap();
        let result = tx
            .exec("INSERT INTO t (v) VALUES (?1)", &[Value::Text("a".into())])
            .await
            .unwrap();
        assert_eq!(result.last_insert_id().unwrap(), 1);

        // visible inside the transaction
        let mut inside = tx.query("SELECT v FROM t", &[]).await.unwrap();
        assert_eq!(inside.rows().await.unwrap().len(), 1);

        tx.commit().await.unwrap();
        assert!(tx.is_done());
        assert_eq!(count(&db).await, "1");
    }

    #[tokio::test]
    async fn test_rollback() {
        let dir = TempDir::new().unwrap();
        let db = setup(&dir).await;

        let tx = db.begin_transaction().await.unwrap();
        tx.exec("INSERT INTO t (v) VALUES ('a')", &[]).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(count(&db).await, "0");
    }

    #[tokio::test]
    async fn test_done_transaction_rejects_calls() {
        let dir = TempDir::new().unwrap();
        let db = setup(&dir).await;

        let tx = db.begin_transaction().await.unwrap();
        let stmt = tx.prepare("INSERT INTO t (v) VALUES (?1)").await.unwrap();
        stmt.exec(&[Value::Text("x".into())]).await.unwrap();
        tx.commit().await.unwrap();

        assert!(matches!(tx.commit().await, Err(Error::TransactionDone)));
        assert!(matches!(tx.rollback().await, Err(Error::TransactionDone)));
        assert!(matches!(tx.exec("DELETE FROM t", &[]).await, Err(Error::TransactionDone)));
        assert!(matches!(
            stmt.exec(&[Value::Text("y".into())]).await,
            Err(Error::TransactionDone)
        ));
        assert_eq!(count(&db).await, "1");
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let dir = TempDir::new().unwrap();
        let db = setup(&dir).await;

        {
            let tx = db.begin_transaction().await.unwrap();
            tx.exec("INSERT INTO t (v) VALUES ('lost')", &[]).await.unwrap();
        }

        // the rollback runs on the blocking pool and then releases the connection
        for _ in 0..100 {
            if db.active_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(db.active_connections(), 0);
        assert_eq!(count(&db).await, "0");
    }

    #[test]
    fn test_drop_outside_runtime_rolls_back() {
        let dir = TempDir::new().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let db = rt.block_on(setup(&dir));

        let tx = rt.block_on(async {
            let tx = db.begin_transaction().await.unwrap();
            tx.exec("INSERT INTO t (v) VALUES ('lost')", &[]).await.unwrap();
            tx
        });
        drop(tx);

        assert_eq!(db.active_connections(), 0);
        assert_eq!(rt.block_on(count(&db)), "0");
    }
}
