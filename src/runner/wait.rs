use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a wait ended before its future did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitInterrupted {
    DeadlineExceeded,
    Cancelled,
}

/// Deadline and cancellation governing one caller's wait.
///
/// A wait context only ever stops the waiting caller. The run being waited on
/// keeps executing.
#[derive(Debug, Clone, Default)]
pub struct WaitContext {
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl WaitContext {
    /// Wait without a deadline and without cancellation.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    pub fn with_cancel(token: CancellationToken) -> Self {
        Self::background().cancel_on(token)
    }

    /// Set a deadline `timeout` from now.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drive `fut` until it finishes or this context interrupts it.
    ///
    /// Cancellation wins over completion, and completion wins over the deadline,
    /// when several are ready at once.
    pub(crate) async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, WaitInterrupted> {
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(WaitInterrupted::Cancelled),
            out = fut => Ok(out),
            _ = expired => Err(WaitInterrupted::DeadlineExceeded),
        }
    }
}
