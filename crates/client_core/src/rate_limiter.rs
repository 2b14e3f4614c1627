use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::CallError;

pub type CallOp<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type ErrorHook<T> = Arc<dyn Fn(CallError, &T) + Send + Sync>;

/// Prevents multiple simultaneous async calls against one logical target.
///
/// A call issued while another is still in flight is remembered in a single
/// successor slot; only the latest remembered args ever execute, older ones
/// are discarded. Suitable for calls that set a value. Each attempt is
/// bounded by a timeout; a timed-out attempt is treated as settled for
/// scheduling purposes but the underlying operation is not aborted.
pub struct RateLimiter<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    op: CallOp<T>,
    timeout: Duration,
    min_interval: Option<Duration>,
    on_error: Option<ErrorHook<T>>,
    state: Mutex<LimiterState<T>>,
}

struct LimiterState<T> {
    busy: bool,
    queued: Option<T>,
}

impl<T> Clone for RateLimiter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + std::fmt::Debug + 'static> RateLimiter<T> {
    pub fn new(timeout: Duration, op: CallOp<T>) -> Self {
        Self::with_options(timeout, op, None, None)
    }

    /// `min_interval` is the minimum delay between the end of one attempt
    /// and the start of the next, independent of operation latency.
    pub fn with_options(
        timeout: Duration,
        op: CallOp<T>,
        min_interval: Option<Duration>,
        on_error: Option<ErrorHook<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                op,
                timeout,
                min_interval,
                on_error,
                state: Mutex::new(LimiterState {
                    busy: false,
                    queued: None,
                }),
            }),
        }
    }

    /// Executes `args` now, or remembers it as the sole successor of the
    /// attempt currently in flight. Returns without waiting either way.
    pub async fn call(&self, args: T) {
        {
            let mut state = self.inner.state.lock().await;
            if state.busy {
                state.queued = Some(args);
                return;
            }
            state.busy = true;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(drain(inner, args));
    }
}

async fn drain<T: Clone + Send + std::fmt::Debug + 'static>(inner: Arc<Inner<T>>, first: T) {
    let mut next = Some(first);
    while let Some(args) = next {
        // Spawned so a timeout only stops waiting, not the operation.
        let mut attempt = tokio::spawn((inner.op)(args.clone()));
        let outcome = match tokio::time::timeout(inner.timeout, &mut attempt).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(CallError::Failed(err)),
            Ok(Err(join_err)) => Err(CallError::Failed(anyhow::anyhow!(join_err))),
            Err(_) => Err(CallError::Timeout(inner.timeout)),
        };

        if let Err(err) = outcome {
            match &inner.on_error {
                Some(hook) => hook(err, &args),
                None => warn!(?args, %err, "rate-limited call failed"),
            }
        }

        if let Some(interval) = inner.min_interval {
            tokio::time::sleep(interval).await;
        }

        let mut state = inner.state.lock().await;
        next = state.queued.take();
        if next.is_none() {
            state.busy = false;
        }
    }
}

#[cfg(test)]
#[path = "tests/rate_limiter_tests.rs"]
mod tests;
