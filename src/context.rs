//! Caller-supplied cancellation and timeouts.
//!
//! Every database call that can block takes a `&Context`. There is no
//! process-wide default: the plain `query`/`exec` variants build a fresh
//! [`Context::background`] for the single call they make.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl Context {
    /// A context that never fires.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self::background().cancellable(token)
    }

    /// Tighten the deadline to `now + timeout`. The earlier deadline wins,
    /// and a zero timeout leaves the context untouched.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            return self;
        }
        if let Some(candidate) = Instant::now().checked_add(timeout) {
            self.deadline = Some(match self.deadline {
                Some(current) => current.min(candidate),
                None => candidate,
            });
        }
        self
    }

    /// Attach a cancellation token, replacing any previous one.
    pub fn cancellable(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The error this context reports if it has already fired.
    pub fn err(&self) -> Option<Error> {
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Some(Error::Canceled);
        }
        if self.deadline.is_some_and(|d| d <= Instant::now()) {
            return Some(Error::DeadlineExceeded);
        }
        None
    }

    /// Drive `fut` until it completes or the context fires, whichever
    /// comes first. A context that has already fired never polls `fut`.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        let canceled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = canceled => Err(Error::Canceled),
            _ = expired => Err(Error::DeadlineExceeded),
            out = fut => out,
        }
    }
}
