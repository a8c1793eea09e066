use parking_lot::RwLock;
use rusqlite::types::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::Context;
use crate::database::Database;
use crate::result::QueryResult;
use crate::transaction::Transaction;
use crate::{Error, Result};

/// Read/write splitting client over one primary and any number of replicas.
///
/// Writes and transactions always go to the primary. Reads go to the primary
/// while no replica is registered, and are spread round-robin over the
/// replicas otherwise. Replicas can be registered while queries are in
/// flight; the replica list only ever grows.
pub struct Client {
    primary: Database,
    replicas: RwLock<Vec<Database>>,
    cursor: AtomicUsize,
}

impl Client {
    /// Opens the primary database. The client starts without replicas.
    pub async fn new(primary: Config) -> Result<Self> {
        let primary = Database::open(primary).await?;
        info!("Client ready with primary {}", primary.id());

        Ok(Client {
            primary,
            replicas: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Opens a replica and adds it to the read rotation.
    ///
    /// A missing config fails with [`Error::InvalidReplica`]. When the open
    /// fails the rotation is left untouched.
    pub async fn register_replica(&self, config: Option<Config>) -> Result<()> {
        let config = config.ok_or(Error::InvalidReplica)?;
        let replica = Database::open(config).await?;

        let mut replicas = self.replicas.write();
        info!("Registered replica {} ({} total)", replica.id(), replicas.len() + 1);
        replicas.push(replica);
        Ok(())
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.read().len()
    }

    /// Executes a query that returns rows on the next read database.
    pub async fn query(&self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        self.get_replica().query(sql, args).await
    }

    pub async fn query_with_context(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<QueryResult> {
        self.get_replica().query_with_context(ctx, sql, args).await
    }

    /// Executes a statement without returning rows on the primary.
    pub async fn exec(&self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        self.primary.exec(sql, args).await
    }

    pub async fn exec_with_context(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<QueryResult> {
        self.primary.exec_with_context(ctx, sql, args).await
    }

    /// Starts a transaction on the primary.
    pub async fn begin_transaction(&self) -> Result<Transaction> {
        self.primary.begin_transaction().await
    }

    pub async fn begin_transaction_with_context(&self, ctx: &Context) -> Result<Transaction> {
        self.primary.begin_transaction_with_context(ctx).await
    }

    pub fn get_primary(&self) -> Database {
        self.primary.clone()
    }

    /// Picks the database the next read goes to.
    pub fn get_replica(&self) -> Database {
        let replicas = self.replicas.read();
        let picked = match replicas.len() {
            0 => &self.primary,
            1 => &replicas[0],
            n => {
                // index by the incremented value, so the first pick is replicas[1]
                let index = self.cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
                &replicas[index % n]
            }
        };
        debug!("Routing read to {}", picked.id());
        picked.clone()
    }

    /// Closes the primary, then every replica in registration order.
    ///
    /// Every database is closed even when an earlier one fails; failures are
    /// logged only.
    pub fn close(&self) {
        for (id, e) in self.close_all() {
            warn!("Failed to close {}: {}", id, e);
        }
    }

    /// Like [`Client::close`], but reports every failure as
    /// [`Error::CloseFailed`].
    pub fn try_close(&self) -> Result<()> {
        let failures = self.close_all();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::CloseFailed(failures))
        }
    }

    fn close_all(&self) -> Vec<(String, Error)> {
        let replicas = self.replicas.read();
        std::iter::once(&self.primary)
            .chain(replicas.iter())
            .filter_map(|db| db.close().err().map(|e| (db.id().to_owned(), e)))
            .collect()
    }
}
