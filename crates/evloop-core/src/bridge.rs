use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{LoopError, Promise, TimeAmount, guard::panic_message};

const RUNNING: u8 = 0;
const SUCCEEDED: u8 = 1;
const FAILED: u8 = 2;
const CANCELLED: u8 = 3;

/// Outcome of a task bridged into a promise. Everything but `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgedTaskState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Handle of a task started with [`Promise::complete_with_task`].
///
/// Cancellation is cooperative: it only cancels the token handed to the body.
pub struct TaskHandle {
    token: CancellationToken,
    state: Arc<AtomicU8>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token observed by the body; clones can cancel without holding the handle.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> BridgedTaskState {
        match self.state.load(Ordering::Acquire) {
            RUNNING => BridgedTaskState::Running,
            SUCCEEDED => BridgedTaskState::Succeeded,
            FAILED => BridgedTaskState::Failed,
            _ => BridgedTaskState::Cancelled,
        }
    }

    /// Waits until the body has finished and its result was offered to the promise.
    pub async fn join(self) -> Result<(), LoopError> {
        self.join.await.map_err(|e| {
            if e.is_panic() {
                LoopError::Panicked(panic_message(e.into_panic().as_ref()))
            } else {
                LoopError::Cancelled
            }
        })
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// Spawns `body` on the ambient tokio runtime and completes this promise with its result.
    ///
    /// The write obeys the usual first-write-wins rule, so an external `fail` racing with the
    /// body is safe. A panicking body fails the promise with [`LoopError::Panicked`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, like `tokio::spawn`.
    pub fn complete_with_task<F, Fut>(&self, body: F) -> TaskHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, LoopError>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(RUNNING));

        let inner = tokio::spawn(body(token.clone()));
        let promise = self.clone();
        let outcome = Arc::clone(&state);
        let join = tokio::spawn(async move {
            let result = match inner.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    Err(LoopError::Panicked(panic_message(e.into_panic().as_ref())))
                }
                Err(_) => Err(LoopError::Cancelled),
            };

            let code = match &result {
                Ok(_) => SUCCEEDED,
                Err(e) if e.is_cancelled() => CANCELLED,
                Err(_) => FAILED,
            };
            outcome.store(code, Ordering::Release);

            if !promise.complete(result) {
                trace!(target: "evloop.core.bridge", "task finished after the promise was completed");
            }
        });

        TaskHandle { token, state, join }
    }
}

/// Suspension-point check for bridged bodies.
#[inline]
pub fn check_cancelled(token: &CancellationToken) -> Result<(), LoopError> {
    if token.is_cancelled() {
        return Err(LoopError::Cancelled);
    }
    Ok(())
}

/// Sleeps for `amount` unless `token` is cancelled first, in which case it returns
/// `Err(LoopError::Cancelled)` right away.
pub async fn sleep(token: &CancellationToken, amount: TimeAmount) -> Result<(), LoopError> {
    check_cancelled(token)?;
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(LoopError::Cancelled),
        _ = tokio::time::sleep(amount.to_std()) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex, Weak,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::LoopFuture;

    #[derive(Debug, thiserror::Error)]
    #[error("handler error")]
    struct HandlerError;

    #[tokio::test]
    async fn completes_with_the_body_value() {
        let promise = Promise::<&'static str>::new();
        let handle = promise.complete_with_task(|token| async move {
            sleep(&token, TimeAmount::nanoseconds(200)).await?;
            check_cancelled(&token)?;
            Ok("OK")
        });

        assert_eq!(promise.future().get().await.unwrap(), "OK");
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn cooperative_body_fails_with_cancellation() {
        let promise = Promise::<u32>::new();
        let handle = promise.complete_with_task(|token| async move {
            loop {
                sleep(&token, TimeAmount::milliseconds(5)).await?;
            }
        });

        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancel_requested());

        let err = promise.future().get().await.unwrap_err();
        assert!(err.is_cancelled());

        let state = Arc::new(Mutex::new(None));
        let recorded = Arc::clone(&state);
        promise.future().when_complete(move |r| {
            *recorded.lock().unwrap() = Some(r.is_err());
        });
        assert_eq!(*state.lock().unwrap(), Some(true));

        let st = handle.state();
        handle.join().await.unwrap();
        assert_eq!(st, BridgedTaskState::Cancelled);
    }

    #[tokio::test]
    async fn body_that_ignores_the_token_runs_to_completion() {
        let promise = Promise::<u32>::new();
        let handle = promise.complete_with_task(|_token| async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(1)
        });
        handle.cancel();

        assert_eq!(promise.future().get().await.unwrap(), 1);
        assert!(handle.is_cancel_requested());
        assert_eq!(handle.state(), BridgedTaskState::Succeeded);
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn panicking_body_fails_the_promise() {
        let promise = Promise::<u32>::new();
        let handle = promise.complete_with_task(|_token| async move {
            if true {
                panic!("body exploded");
            }
            Ok(0)
        });

        let err = promise.future().get().await.unwrap_err();
        assert!(matches!(err, LoopError::Panicked(ref msg) if msg == "body exploded"));
        handle.join().await.unwrap();
    }

    /// Owner of a promise and of the task completing it. On failure it cancels the task and
    /// fails the promise itself, racing the task's own cancellation error.
    struct Handler {
        promise: Promise<&'static str>,
        task: Mutex<Option<TaskHandle>>,
        completions: AtomicUsize,
        outcome: Mutex<Option<Result<&'static str, String>>>,
    }

    impl Handler {
        fn start() -> Arc<Self> {
            let handler = Arc::new(Handler {
                promise: Promise::new(),
                task: Mutex::new(None),
                completions: AtomicUsize::new(0),
                outcome: Mutex::new(None),
            });

            let back: Weak<Handler> = Arc::downgrade(&handler);
            handler.future().when_complete(move |result| {
                if let Some(h) = back.upgrade() {
                    h.on_complete(result);
                }
            });

            let task = handler.promise.complete_with_task(|token| async move {
                sleep(&token, TimeAmount::nanoseconds(200)).await?;
                check_cancelled(&token)?;
                Ok("OK")
            });
            *handler.task.lock().unwrap() = Some(task);
            handler
        }

        fn future(&self) -> LoopFuture<&'static str> {
            self.promise.future()
        }

        fn on_complete(&self, result: &Result<&'static str, LoopError>) {
            self.completions.fetch_add(1, Ordering::SeqCst);
            *self.outcome.lock().unwrap() = Some(result.as_ref().map(|v| *v).map_err(|e| e.to_string()));
            if let Err(e) = result {
                self.handle_error(e.clone());
            }
        }

        fn mock_error(&self) {
            self.handle_error(LoopError::other(HandlerError));
        }

        fn handle_error(&self, error: LoopError) {
            if let Some(task) = self.task.lock().unwrap().as_ref() {
                task.cancel();
            }
            self.promise.fail(error);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn external_failure_races_task_cancellation() {
        for _ in 0..500 {
            let h = Handler::start();
            tokio::time::sleep(std::time::Duration::from_micros(1)).await;
            h.mock_error();
            tokio::time::sleep(std::time::Duration::from_micros(1)).await;

            let task = h.task.lock().unwrap().take().expect("task was started");
            task.join().await.unwrap();

            assert_eq!(h.completions.load(Ordering::SeqCst), 1);
            let observed = h.outcome.lock().unwrap().clone().expect("promise completed");
            let settled = h.future().result().unwrap().map_err(|e| e.to_string());
            assert_eq!(observed, settled);
            match observed {
                Ok(v) => assert_eq!(v, "OK"),
                Err(msg) => assert!(msg == "handler error" || msg == "cancelled"),
            }
        }
    }
}
