//! Per-call cancellation/deadline propagation (spec §5 "Suspension points",
//! "Cancellation/timeout"). Ambient via a task-local, the way `tracing` threads
//! a span through a call stack without a parameter on every signature: a caller
//! that cares wraps its call in [`CallContext::scope`], and every `Store` method
//! honors whatever is currently scoped. A call with no scope active (every
//! existing call site, today) behaves exactly as if cancellation didn't exist.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

tokio::task_local! {
    static CALL_CONTEXT: CallContext;
}

/// A deadline and/or cancellation signal threaded through one logical call.
#[derive(Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// A context that abandons the call if it's still running after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        CallContext {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// A handle the caller can fire to cancel the call explicitly, independent of
    /// (or before) any deadline.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs `fut` with this context active for every `Store` call it makes.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CALL_CONTEXT.scope(self, fut).await
    }

    fn current() -> Self {
        CALL_CONTEXT.try_with(Clone::clone).unwrap_or_default()
    }
}

/// Wraps a suspension point so it honors the ambient [`CallContext`]. Abandons
/// `fut` and surfaces `Error::Cancelled` the moment the deadline elapses or the
/// token fires, rather than waiting for the database/Redis round-trip to finish
/// on its own (spec §5 "methods should abandon retries promptly").
pub(crate) async fn guarded<T>(fut: impl Future<Output = Result<T, Error>>) -> Result<T, Error> {
    let ctx = CallContext::current();
    let op = async {
        match ctx.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| Error::Cancelled)?,
            None => fut.await,
        }
    };

    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
        res = op => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    async fn slow_ok() -> Result<u32, Error> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(7)
    }

    #[tokio::test]
    async fn uninstrumented_call_is_unaffected() {
        assert_eq!(guarded(slow_ok()).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn deadline_abandons_the_call() {
        let ctx = CallContext::with_timeout(Duration::from_millis(20));
        let err = ctx.clone().scope(guarded(slow_ok())).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn cancel_handle_abandons_the_call_before_the_deadline() {
        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        let cancel = ctx.cancel_handle();
        let started = Arc::new(AtomicBool::new(false));
        let started2 = started.clone();

        let call = ctx.clone().scope(guarded(async move {
            started2.store(true, Ordering::SeqCst);
            slow_ok().await
        }));
        tokio::pin!(call);

        tokio::select! {
            _ = &mut call => panic!("call should not finish before cancellation"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => cancel.cancel(),
        }

        let err = call.await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn context_does_not_leak_across_sibling_calls() {
        let fast = guarded(async { Ok::<_, Error>(1) }).await.unwrap();
        assert_eq!(fast, 1);

        let ctx = CallContext::with_timeout(Duration::from_millis(5));
        let _ = ctx.scope(guarded(slow_ok())).await;

        // Outside any `scope`, a later call sees no deadline at all.
        assert_eq!(guarded(slow_ok()).await.unwrap(), 7);
    }
}
