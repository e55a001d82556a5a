//! Per-call deadline and cancellation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use onair_core::{OnAirResult, StoreError};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation flag shared between a caller and in-flight calls.
///
/// Clones observe the same flag. Cancelling wakes every task waiting in
/// [`CancellationToken::cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Deadline and cancellation for one logical operation.
///
/// A default context never expires and is never cancelled.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire `timeout` from now. A timeout too large to represent means no
    /// deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast when the context is already cancelled or expired.
    pub fn check(&self) -> OnAirResult<()> {
        if self.token.is_cancelled() {
            return Err(StoreError::Cancelled.into());
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StoreError::DeadlineExceeded.into());
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first. A losing future is dropped.
    pub async fn run<T, F>(&self, fut: F) -> OnAirResult<T>
    where
        F: Future<Output = OnAirResult<T>>,
    {
        self.check()?;
        let expiry = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(StoreError::Cancelled.into()),
            _ = expiry => Err(StoreError::DeadlineExceeded.into()),
            out = fut => out,
        }
    }

    /// Sleep for `delay`, cut short by cancellation or the deadline.
    pub async fn sleep(&self, delay: Duration) -> OnAirResult<()> {
        self.run(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }
}
