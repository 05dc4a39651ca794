//! Operator cancellation.
//!
//! An [`AbortHandle`] is held by whoever may cancel a run (the CLI installs one
//! on Ctrl-C). Every component that can block holds an [`AbortSignal`] and
//! either checks it at boundaries or awaits [`AbortSignal::aborted`] alongside
//! its own work.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Sending half: requests cancellation of a run.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Receiving half: observed by the executor and running operations.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/signal pair.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

impl AbortHandle {
    /// Request cancellation. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// Another signal observing this handle.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl AbortSignal {
    /// A signal that never fires. Used for post-actions and hooks, which must
    /// run to completion even after the run was aborted.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested; pends forever otherwise.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without aborting.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `body` with a signal that fires when this one does or once
    /// `deadline` has elapsed, then wait for `body` to wind down by itself.
    ///
    /// `body` is never dropped early, so a running process still goes through
    /// its graceful termination path. The flag reports whether the deadline
    /// fired.
    pub async fn bounded<F, Fut>(
        &self,
        deadline: Option<Duration>,
        body: F,
    ) -> (Fut::Output, bool)
    where
        F: FnOnce(AbortSignal) -> Fut,
        Fut: Future,
    {
        let (stop, signal) = abort_pair();
        let body = body(signal);
        tokio::pin!(body);

        let expired = tokio::select! {
            output = &mut body => return (output, false),
            _ = self.aborted() => false,
            _ = sleep_for(deadline) => true,
        };
        stop.abort();
        (body.await, expired)
    }
}

async fn sleep_for(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_starts_clear() {
        let (_handle, signal) = abort_pair();
        assert!(!signal.is_aborted());
    }

    #[tokio::test]
    async fn test_abort_is_observed() {
        let (handle, signal) = abort_pair();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.aborted().await }
        });
        handle.abort();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("abort not observed")
            .expect("join");
        assert!(signal.is_aborted());
        assert!(handle.signal().is_aborted());
    }

    #[tokio::test]
    async fn test_bounded_fires_inner_signal_on_deadline() {
        let parent = AbortSignal::never();
        let (winding_down, expired) = parent
            .bounded(Some(Duration::from_millis(20)), |stop| async move {
                stop.aborted().await;
                "wound down"
            })
            .await;
        assert_eq!(winding_down, "wound down");
        assert!(expired);
    }

    #[tokio::test]
    async fn test_bounded_forwards_parent_abort() {
        let (handle, signal) = abort_pair();
        let (observed, expired) = signal
            .bounded(None, |stop| async move {
                handle.abort();
                stop.aborted().await;
                stop.is_aborted()
            })
            .await;
        assert!(observed);
        assert!(!expired);
    }

    #[tokio::test]
    async fn test_bounded_returns_finished_body() {
        let (value, expired) = AbortSignal::never()
            .bounded(Some(Duration::from_secs(5)), |_| async { 7 })
            .await;
        assert_eq!(value, 7);
        assert!(!expired);
    }

    #[tokio::test]
    async fn test_never_signal_does_not_fire() {
        let signal = AbortSignal::never();
        let waited = tokio::time::timeout(Duration::from_millis(20), signal.aborted()).await;
        assert!(waited.is_err());
        assert!(!signal.is_aborted());
    }
}
