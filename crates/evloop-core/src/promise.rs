use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::oneshot;

use crate::{
    LoopError,
    event::{LoopEvent, LoopEventKind, log_event},
};

type Outcome<T> = Arc<Result<T, LoopError>>;
type Callback<T> = Box<dyn FnOnce(&Result<T, LoopError>) + Send>;

const LABEL: &str = "promise";

struct Cell<T> {
    result: Option<Outcome<T>>,
    callbacks: Vec<Callback<T>>,
    /// Pending `get` calls. Abandoned ones are pruned whenever a new one registers.
    waiters: Vec<oneshot::Sender<Outcome<T>>>,
}

/// Single-assignment cell shared by every producer and observer of one result.
struct Shared<T> {
    cell: Mutex<Cell<T>>,
    done: Condvar,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            cell: Mutex::new(Cell {
                result: None,
                callbacks: Vec::new(),
                waiters: Vec::new(),
            }),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Cell<T>> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First write wins; continuations run after the lock is released.
    fn complete(&self, result: Result<T, LoopError>) -> bool {
        let (outcome, callbacks, waiters) = {
            let mut cell = self.lock();
            if cell.result.is_some() {
                drop(cell);
                log_event(LoopEvent::new(LoopEventKind::PromiseConflict, LABEL));
                return false;
            }
            let outcome = Arc::new(result);
            cell.result = Some(Arc::clone(&outcome));
            (
                outcome,
                std::mem::take(&mut cell.callbacks),
                std::mem::take(&mut cell.waiters),
            )
        };

        self.done.notify_all();
        for waiter in waiters {
            let _ = waiter.send(Arc::clone(&outcome));
        }
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }

    fn attach(&self, callback: Callback<T>) {
        let mut cell = self.lock();
        match cell.result.clone() {
            Some(outcome) => {
                drop(cell);
                callback(&outcome);
            }
            None => cell.callbacks.push(callback),
        }
    }

    fn outcome(&self) -> Option<Outcome<T>> {
        self.lock().result.clone()
    }
}

/// Fails the cell with [`LoopError::BrokenPromise`] once the last producer goes away.
struct Producer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        if self.shared.outcome().is_none() && self.shared.complete(Err(LoopError::BrokenPromise)) {
            log_event(LoopEvent::new(LoopEventKind::PromiseBroken, LABEL));
        }
    }
}

/// Write side of a single-assignment result.
///
/// Clones share the same cell; the first `succeed`/`fail`/`complete` wins and every later
/// attempt is dropped and reported as `false`.
pub struct Promise<T> {
    producer: Arc<Producer<T>>,
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            producer: Arc::new(Producer {
                shared: Arc::new(Shared::new()),
            }),
        }
    }

    /// The read side observing this promise.
    pub fn future(&self) -> LoopFuture<T> {
        LoopFuture {
            shared: Arc::clone(&self.producer.shared),
        }
    }

    /// Returns `true` if this call completed the promise.
    pub fn complete(&self, result: Result<T, LoopError>) -> bool {
        self.producer.shared.complete(result)
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(&self, error: LoopError) -> bool {
        self.complete(Err(error))
    }

    pub fn is_complete(&self) -> bool {
        self.producer.shared.outcome().is_some()
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Completes this promise with whatever `future` eventually holds.
    pub fn complete_with(&self, future: &LoopFuture<T>) {
        future.cascade(self);
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Read side of a single-assignment result.
///
/// Continuations attached before completion run on the completing context; those attached
/// afterwards run immediately on the attaching context.
pub struct LoopFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> LoopFuture<T> {
    pub fn when_complete<F>(&self, f: F)
    where
        F: FnOnce(&Result<T, LoopError>) + Send + 'static,
    {
        self.shared.attach(Box::new(f));
    }

    pub fn when_success<F>(&self, f: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.when_complete(move |result| {
            if let Ok(value) = result {
                f(value);
            }
        });
    }

    pub fn when_failure<F>(&self, f: F)
    where
        F: FnOnce(&LoopError) + Send + 'static,
    {
        self.when_complete(move |result| {
            if let Err(err) = result {
                f(err);
            }
        });
    }

    pub fn is_complete(&self) -> bool {
        self.shared.outcome().is_some()
    }
}

impl<T: Clone> LoopFuture<T> {
    /// Non-blocking peek at the result.
    pub fn result(&self) -> Option<Result<T, LoopError>> {
        self.shared.outcome().map(|outcome| (*outcome).clone())
    }

    /// Waits for completion without blocking the calling thread. Dropping the returned future
    /// before it resolves leaves nothing behind but a closed sender, pruned on the next call.
    pub async fn get(&self) -> Result<T, LoopError> {
        let rx = {
            let mut cell = self.shared.lock();
            if let Some(outcome) = cell.result.clone() {
                drop(cell);
                return (*outcome).clone();
            }
            cell.waiters.retain(|waiter| !waiter.is_closed());
            let (tx, rx) = oneshot::channel();
            cell.waiters.push(tx);
            rx
        };
        match rx.await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => Err(LoopError::BrokenPromise),
        }
    }

    /// Blocks the calling thread for at most `timeout`. Never call it on the loop that completes
    /// the future.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, LoopError>> {
        let cell = self.shared.lock();
        let (cell, _) = self
            .shared
            .done
            .wait_timeout_while(cell, timeout, |cell| cell.result.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        let outcome = cell.result.clone();
        drop(cell);
        outcome.map(|outcome| (*outcome).clone())
    }
}

impl<T: Clone + Send + Sync + 'static> LoopFuture<T> {

    /// Forwards this future's result into `to`, first write wins on `to` as usual.
    pub fn cascade(&self, to: &Promise<T>) {
        let to = to.clone();
        self.when_complete(move |result| {
            to.complete(result.clone());
        });
    }

    pub fn map<U, F>(&self, f: F) -> LoopFuture<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let next = Promise::new();
        let future = next.future();
        self.when_complete(move |result| {
            next.complete(result.as_ref().map(f).map_err(Clone::clone));
        });
        future
    }
}

impl<T> Clone for LoopFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for LoopFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopFuture")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Barrier,
        atomic::{AtomicUsize, Ordering},
    };
    use std::thread;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("external failure")]
    struct ExternalError;

    #[test]
    fn first_completion_wins() {
        let promise = Promise::new();
        let future = promise.future();

        assert!(promise.succeed("first".to_string()));
        assert!(!promise.fail(LoopError::Cancelled));
        assert!(!promise.succeed("second".to_string()));

        assert_eq!(future.result().unwrap().unwrap(), "first");
    }

    #[test]
    fn continuations_attached_before_and_after_completion_run_once() {
        let promise = Promise::<u32>::new();
        let future = promise.future();
        let calls = Arc::new(AtomicUsize::new(0));

        let before = Arc::clone(&calls);
        future.when_success(move |v| {
            assert_eq!(*v, 7);
            before.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        promise.succeed(7);
        promise.succeed(8);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let after = Arc::clone(&calls);
        future.when_success(move |v| {
            assert_eq!(*v, 7);
            after.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn continuation_may_complete_its_own_promise() {
        let promise = Promise::<u32>::new();
        let inner = promise.clone();
        promise.future().when_failure(move |_| {
            assert!(!inner.fail(LoopError::other(ExternalError)));
        });

        assert!(promise.fail(LoopError::Cancelled));
        assert!(promise.future().result().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn dropping_last_producer_breaks_the_promise() {
        let promise = Promise::<u32>::new();
        let future = promise.future();
        let clone = promise.clone();

        drop(promise);
        assert!(!future.is_complete());

        drop(clone);
        assert!(matches!(
            future.result(),
            Some(Err(LoopError::BrokenPromise))
        ));
    }

    #[test]
    fn concurrent_completions_expose_a_single_result() {
        for _ in 0..200 {
            let promise = Promise::<&'static str>::new();
            let future = promise.future();
            let barrier = Arc::new(Barrier::new(2));
            let seen = Arc::new(Mutex::new(Vec::new()));

            for _ in 0..4 {
                let seen = Arc::clone(&seen);
                future.when_complete(move |r| {
                    seen.lock().unwrap().push(r.as_ref().map(|v| *v).map_err(|e| e.to_string()));
                });
            }

            let task_side = {
                let promise = promise.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    promise.fail(LoopError::Cancelled)
                })
            };
            let external_side = {
                let promise = promise.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    promise.fail(LoopError::other(ExternalError))
                })
            };

            let a = task_side.join().unwrap();
            let b = external_side.join().unwrap();
            assert!(a ^ b, "exactly one completion must win");

            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 4);
            assert!(seen.iter().all(|r| r == &seen[0]));
            let last = future.result().unwrap().map_err(|e| e.to_string());
            assert_eq!(last, seen[0]);
        }
    }

    #[test]
    fn map_and_cascade_forward_results() {
        let source = Promise::<u32>::new();
        let mapped = source.future().map(|v| v * 2);
        let target = Promise::<u32>::new();
        target.complete_with(&source.future());

        source.succeed(21);
        assert_eq!(mapped.result().unwrap().unwrap(), 42);
        assert_eq!(target.future().result().unwrap().unwrap(), 21);
    }

    #[test]
    fn wait_timeout_returns_none_while_pending() {
        let promise = Promise::<u32>::new();
        let future = promise.future();
        assert!(future.wait_timeout(Duration::from_millis(5)).is_none());

        let producer = promise.clone();
        thread::spawn(move || producer.succeed(5));
        assert_eq!(
            future.wait_timeout(Duration::from_secs(5)).unwrap().unwrap(),
            5
        );
    }

    #[test]
    fn timed_out_waits_leave_nothing_behind() {
        let promise = Promise::<u32>::new();
        let future = promise.future();

        for _ in 0..50 {
            assert!(future.wait_timeout(Duration::from_millis(1)).is_none());
        }
        assert!(future.shared.lock().callbacks.is_empty());

        promise.succeed(9);
        assert_eq!(future.wait_timeout(Duration::ZERO).unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn abandoned_gets_are_pruned() {
        let promise = Promise::<u32>::new();
        let future = promise.future();

        for _ in 0..50 {
            let attempt = tokio::time::timeout(Duration::from_millis(1), future.get()).await;
            assert!(attempt.is_err());
        }
        {
            let cell = future.shared.lock();
            assert!(cell.callbacks.is_empty());
            assert!(cell.waiters.len() <= 1);
        }

        let producer = promise.clone();
        tokio::spawn(async move {
            producer.succeed(4);
        });
        assert_eq!(future.get().await.unwrap(), 4);
        assert!(future.shared.lock().waiters.is_empty());
    }

    #[tokio::test]
    async fn get_resolves_after_completion() {
        let promise = Promise::<String>::new();
        let future = promise.future();

        let producer = promise.clone();
        tokio::spawn(async move {
            producer.succeed("done".into());
        });

        assert_eq!(future.get().await.unwrap(), "done");
        assert_eq!(future.get().await.unwrap(), "done");
    }
}
