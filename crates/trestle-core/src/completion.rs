//! Single-fire completion signal.
//!
//! A [`CompletionSignal`] tells the exchange that the response has finished
//! being written. It is resolved once, from whichever thread gets there first:
//! the bridge itself for synchronous requests, or the code holding an
//! [`AsyncResponse`](crate::AsyncResponse) for suspended ones. Later attempts
//! are ignored and report `false`.

use crate::error::{BridgeError, WaitError};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;

const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
const SUCCEEDED: u8 = 2;
const FAILED: u8 = 3;

/// Cloneable handle to a one-shot success/failure signal.
///
/// # Example
///
/// ```
/// use trestle_core::CompletionSignal;
///
/// let signal = CompletionSignal::new();
/// assert!(signal.succeed());
/// assert!(!signal.succeed());
/// assert!(signal.is_done());
/// ```
#[derive(Clone, Default)]
pub struct CompletionSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: AtomicU8,
    error: OnceLock<BridgeError>,
    notify: Notify,
}

impl CompletionSignal {
    /// Creates a pending signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the signal as succeeded.
    ///
    /// Returns `false` if the signal was already resolved.
    pub fn succeed(&self) -> bool {
        self.resolve(SUCCEEDED, None)
    }

    /// Resolves the signal as failed with `error`.
    ///
    /// Returns `false` if the signal was already resolved; the first outcome
    /// is kept.
    pub fn fail(&self, error: BridgeError) -> bool {
        self.resolve(FAILED, Some(error))
    }

    fn resolve(&self, target: u8, error: Option<BridgeError>) -> bool {
        if self
            .inner
            .state
            .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!("completion signal already resolved, ignoring");
            return false;
        }
        if let Some(error) = error {
            // Only the claiming thread reaches this point.
            let _ = self.inner.error.set(error);
        }
        self.inner.state.store(target, Ordering::Release);
        self.inner.notify.notify_waiters();
        true
    }

    /// Returns `true` once a terminal outcome is visible.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) >= SUCCEEDED
    }

    /// Returns the terminal outcome, or `None` while the signal is pending.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<(), BridgeError>> {
        match self.inner.state.load(Ordering::Acquire) {
            SUCCEEDED => Some(Ok(())),
            FAILED => self.inner.error.get().cloned().map(Err),
            _ => None,
        }
    }

    /// Waits for the signal, optionally bounded by `bound`.
    ///
    /// A timeout leaves the signal pending so that it can still be resolved
    /// by whoever handles the timeout.
    pub async fn wait(&self, bound: Option<Duration>) -> Result<(), WaitError> {
        match bound {
            Some(bound) => tokio::time::timeout(bound, self.settled())
                .await
                .map_err(|_| WaitError::TimedOut(bound))?
                .map_err(WaitError::Failed),
            None => self.settled().await.map_err(WaitError::Failed),
        }
    }

    async fn settled(&self) -> Result<(), BridgeError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a resolution in between is not missed.
            notified.as_mut().enable();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            PENDING | CLAIMED => "pending",
            SUCCEEDED => "succeeded",
            _ => "failed",
        };
        f.debug_struct("CompletionSignal").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;

    #[test]
    fn test_first_resolution_wins() {
        let signal = CompletionSignal::new();
        assert!(signal.outcome().is_none());

        assert!(signal.fail(DispatchError::failed("first").into()));
        assert!(!signal.succeed());
        assert!(!signal.fail(DispatchError::failed("second").into()));

        let outcome = signal.outcome().expect("resolved");
        let error = outcome.expect_err("failed outcome");
        assert!(error.to_string().contains("first"));
    }

    #[test]
    fn test_clones_share_state() {
        let signal = CompletionSignal::new();
        let other = signal.clone();
        assert!(other.succeed());
        assert!(signal.is_done());
        assert!(matches!(signal.outcome(), Some(Ok(()))));
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_resolved() {
        let signal = CompletionSignal::new();
        signal.succeed();
        assert!(signal.wait(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_observes_resolution_from_another_thread() {
        let signal = CompletionSignal::new();
        let completer = signal.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.succeed()
        });

        signal
            .wait(Some(Duration::from_secs(5)))
            .await
            .expect("signal resolved");
        assert!(handle.join().expect("thread joined"));
    }

    #[tokio::test]
    async fn test_wait_reports_failure() {
        let signal = CompletionSignal::new();
        let completer = signal.clone();
        tokio::spawn(async move {
            completer.fail(DispatchError::failed("async boom").into());
        });

        let error = signal.wait(None).await.expect_err("failure");
        assert!(matches!(error, WaitError::Failed(BridgeError::Dispatch(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_signal_pending() {
        let signal = CompletionSignal::new();
        let bound = Duration::from_millis(100);

        let error = signal.wait(Some(bound)).await.expect_err("timed out");
        assert!(matches!(error, WaitError::TimedOut(d) if d == bound));
        assert!(!signal.is_done());

        // Whoever handles the timeout can still resolve it.
        assert!(signal.succeed());
        assert!(signal.wait(Some(bound)).await.is_ok());
    }

    #[test]
    fn test_wait_without_resolution_stays_pending() {
        let signal = CompletionSignal::new();
        let mut wait = tokio_test::task::spawn(signal.wait(None));
        tokio_test::assert_pending!(wait.poll());

        signal.succeed();
        assert!(wait.is_woken());
        tokio_test::assert_ready_ok!(wait.poll());
    }
}
