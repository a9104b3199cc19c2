//! Cooperative cancellation for runs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// The run was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("run aborted")]
pub struct Aborted;

/// Requests cancellation of the runs holding the paired [`AbortSignal`].
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observed by the scheduler at the top of every cycle and inside every
/// delay, hold and injector call.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

impl AbortSignal {
    /// A signal nothing can fire.
    #[must_use]
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once abort is requested; never if the handle is gone.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), Aborted> {
        self.guard(tokio::time::sleep(duration)).await
    }

    pub async fn sleep_until(&self, deadline: tokio::time::Instant) -> Result<(), Aborted> {
        self.guard(tokio::time::sleep_until(deadline)).await
    }

    /// Run `fut` unless abort is requested first.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Aborted> {
        if self.is_aborted() {
            return Err(Aborted);
        }
        tokio::select! {
            biased;
            _ = self.aborted() => Err(Aborted),
            out = fut => Ok(out),
        }
    }
}
