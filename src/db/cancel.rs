//! Deadline and cancellation plumbing for store operations.
//!
//! Every public store call takes an [`OpContext`]. A context that has already
//! fired fails the call before any SQL is issued, and a context that fires
//! while a call is in flight (including during a retry backoff) aborts it.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::error::{StoreError, StoreResult};

#[derive(Clone, Debug, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Fires every [`OpContext`] derived from the pair it was created with.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl OpContext {
    /// A context that never expires and cannot be cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn cancellable() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx },
            Self {
                deadline: None,
                cancel: Some(rx),
            },
        )
    }

    /// Derives a context that also expires `timeout` from now. The earlier of
    /// the two deadlines wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Fails fast when the context has already fired.
    pub fn check(&self) -> StoreResult<()> {
        if self.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StoreError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> StoreError {
        tokio::select! {
            biased;
            _ = self.cancelled() => StoreError::Cancelled,
            _ = self.expired() => StoreError::DeadlineExceeded,
        }
    }

    /// Sleeps for `delay`, returning early with an error if the context fires.
    pub async fn sleep(&self, delay: Duration) -> StoreResult<()> {
        self.run(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }

    /// Races `fut` against the context.
    pub async fn run<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }

    async fn cancelled(&self) {
        let Some(rx) = self.cancel.as_ref() else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling; this context can no longer fire.
                return std::future::pending().await;
            }
        }
    }

    async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
