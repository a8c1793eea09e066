pub mod client;
pub mod config;
pub mod context;
pub mod database;
pub mod options;
pub mod pool;
pub mod result;
pub mod statement;
pub mod transaction;

pub use client::Client;
pub use config::{Config, ConnParams};
pub use context::Context;
pub use database::Database;
pub use options::DatabaseOption;
pub use pool::{PoolStats, PooledConnection, SqlitePool};
pub use result::{QueryResult, Row};
pub use statement::Statement;
pub use transaction::Transaction;

/// Positional statement argument.
pub use rusqlite::types::Value;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid replica")]
    InvalidReplica,

    #[error("no columns found")]
    NoColumnsFound,

    #[error("not implemented")]
    NotImplemented,

    #[error("result does not hold a mutation outcome")]
    NoMutationOutcome,

    #[error("database is closed")]
    Closed,

    #[error("transaction has already been committed or rolled back")]
    TransactionDone,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("context canceled")]
    Canceled,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("database worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// Only produced by [`Client::try_close`].
    #[error("failed to close {} database(s)", .0.len())]
    CloseFailed(Vec<(String, Error)>),
}

impl Error {
    /// True when the error came from the caller's [`Context`] firing.
    pub fn is_context_error(&self) -> bool {
        matches!(self, Error::DeadlineExceeded | Error::Canceled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
