use rusqlite::types::Value;
use std::fmt;
use tracing::debug;

use crate::context::Context;
use crate::database::Database;
use crate::result::QueryResult;
use crate::transaction::Pinned;
use crate::Result;

enum Target {
    Database(Database),
    Transaction(Pinned),
}

/// A prepared statement bound to a database or to a transaction.
///
/// The SQL is compiled once per pooled connection and reused through the
/// connection's statement cache.
pub struct Statement {
    target: Target,
    sql: String,
}

impl Statement {
    pub(crate) fn for_database(db: Database, sql: &str) -> Self {
        Statement {
            target: Target::Database(db),
            sql: sql.to_owned(),
        }
    }

    pub(crate) fn for_transaction(pinned: Pinned, sql: &str) -> Self {
        Statement {
            target: Target::Transaction(pinned),
            sql: sql.to_owned(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub async fn query(&self, args: &[Value]) -> Result<QueryResult> {
        self.query_with_context(&Context::background(), args).await
    }

    pub async fn query_with_context(&self, ctx: &Context, args: &[Value]) -> Result<QueryResult> {
        match &self.target {
            Target::Database(db) => db.query_inner(ctx, self.sql.clone(), args.to_vec(), true).await,
            Target::Transaction(pinned) => pinned.query(ctx, self.sql.clone(), args.to_vec(), true).await,
        }
    }

    pub async fn exec(&self, args: &[Value]) -> Result<QueryResult> {
        self.exec_with_context(&Context::background(), args).await
    }

    pub async fn exec_with_context(&self, ctx: &Context, args: &[Value]) -> Result<QueryResult> {
        match &self.target {
            Target::Database(db) => db.exec_inner(ctx, self.sql.clone(), args.to_vec(), true).await,
            Target::Transaction(pinned) => pinned.exec(ctx, self.sql.clone(), args.to_vec(), true).await,
        }
    }

    /// Releases the statement. Cached compilations stay with their
    /// connections until those are closed.
    pub fn close(self) {
        debug!("Closed statement: {}", self.sql);
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.target {
            Target::Database(db) => db.id().to_owned(),
            Target::Transaction(_) => "transaction".to_owned(),
        };
        f.debug_struct("Statement")
            .field("target", &target)
            .field("sql", &self.sql)
            .finish()
    }
}
