//! Cooperative cancellation built on `tokio::sync::watch`.
//!
//! A [`CancelSource`] is owned by whoever may stop a flow (the session manager
//! for a tenant, the CLI for the whole engine). Tasks hold [`CancelToken`]s and
//! check them at suspension points: before network calls, while waiting for a
//! rate-limit slot, and during flood-wait sleeps.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

/// Returned when a guarded future was abandoned because its token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone)]
pub struct CancelSource {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSource {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal every outstanding token. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Wrap an existing shutdown receiver (`true` means stop).
    #[must_use]
    pub const fn from_receiver(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is signalled. Pends forever if the source is dropped
    /// without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `fut` unless the token fires first.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if the token fired before `fut` completed (or was
    /// already fired on entry).
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            biased;
            () = self.cancelled() => Err(Cancelled),
            out = fut => Ok(out),
        }
    }
}
