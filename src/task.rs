//! Cancelable units of work.
//!
//! Queue tasks come in two shapes: a one-shot future, and a stepped sequence
//! that yields awaitable stages one at a time. Both collapse into a single
//! cancellation handle: the first `cancel()` call interrupts the computation
//! at its next suspension point and surfaces [`Error::Canceled`]. Later
//! calls are no-ops.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::{Stream, StreamExt};
use tokio::sync::watch;

use crate::error::Error;

pub type TaskResult = Result<(), Error>;
pub type TaskFuture = BoxFuture<'static, TaskResult>;

/// A lazy sequence of awaitable steps. The stream itself is pulled under the
/// cancellation race, so a canceled task stops producing further steps.
pub type StepStream = Pin<Box<dyn Stream<Item = TaskFuture> + Send>>;

/// The callback shape accepted by the queue.
pub enum TaskBody {
    /// A plain async computation, run to completion.
    OneShot(Box<dyn FnOnce() -> TaskFuture + Send>),
    /// A stepped computation; every yielded stage is a cancellation boundary.
    Stepped(Box<dyn FnOnce() -> StepStream + Send>),
}

impl TaskBody {
    pub fn one_shot<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        TaskBody::OneShot(Box::new(move || Box::pin(f())))
    }

    pub fn stepped<F>(f: F) -> Self
    where
        F: FnOnce() -> StepStream + Send + 'static,
    {
        TaskBody::Stepped(Box::new(f))
    }

    /// Convenience: a stepped body over an eagerly-known list of stages.
    pub fn steps(steps: Vec<TaskFuture>) -> Self {
        TaskBody::stepped(move || Box::pin(futures::stream::iter(steps)) as StepStream)
    }

    /// Invoke the callback, producing the awaitable work.
    ///
    /// The callback itself is the task's synchronous segment: the scheduler
    /// primes one promoted task before looking at the queue again, so a
    /// body that stops its own queue takes effect ahead of any further
    /// promotion.
    pub fn prime(self) -> TaskWork {
        match self {
            TaskBody::OneShot(f) => TaskWork::Future(f()),
            TaskBody::Stepped(f) => TaskWork::Steps(f()),
        }
    }
}

/// A primed task: the callback has run, the awaitable part remains.
pub enum TaskWork {
    Future(TaskFuture),
    Steps(StepStream),
}

/// Clonable cancellation signal shared between a task and its handles.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Whether two tokens refer to the same underlying signal. Used to tell
    /// a task instance apart from a newer one that reused its id.
    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }

    /// Resolves once the token is canceled; never resolves otherwise.
    pub async fn canceled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Every sender clone dropped without canceling.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Run primed task work under a cancellation race.
///
/// One-shot futures are raced as a whole; step streams race both the pull
/// of the next stage and the await of each yielded stage, so cancellation
/// lands at the nearest suspension boundary.
pub async fn run_task(work: TaskWork, token: CancelToken) -> TaskResult {
    if token.is_canceled() {
        return Err(Error::Canceled);
    }
    match work {
        TaskWork::Future(fut) => {
            tokio::select! {
                biased;
                _ = token.canceled() => Err(Error::Canceled),
                result = fut => result,
            }
        }
        TaskWork::Steps(mut steps) => {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.canceled() => return Err(Error::Canceled),
                    next = steps.next() => next,
                };
                let Some(step) = next else {
                    return Ok(());
                };
                tokio::select! {
                    biased;
                    _ = token.canceled() => return Err(Error::Canceled),
                    result = step => result?,
                }
            }
        }
    }
}

/// Cancellation handle detached from a [`Cancelable`] future.
///
/// `cancel()` runs the future's cleanup closure synchronously (exactly
/// once, across all clones) before signaling the token, so nested
/// cancelables can be torn down even when their future is never polled
/// again.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancelToken,
    cleanup: Arc<std::sync::Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let cleanup = self.cleanup.lock().unwrap().take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }
}

/// A future carrying its own cancellation handle.
///
/// Awaiting resolves the underlying value; `cancel()` (on the future or a
/// detached handle) runs the cleanup closure and makes the future resolve
/// `Err(Error::Canceled)` at its next poll.
pub struct Cancelable<T> {
    inner: BoxFuture<'static, Result<T, Error>>,
    handle: CancelHandle,
}

impl<T: Send + 'static> Cancelable<T> {
    pub fn new<Fut>(future: Fut) -> Self
    where
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Self::with_cleanup(future, || {})
    }

    /// Wrap `future`; on cancellation, `cleanup` runs once from within
    /// `cancel()` itself before the canceled rejection is surfaced.
    pub fn with_cleanup<Fut, C>(future: Fut, cleanup: C) -> Self
    where
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let token = CancelToken::new();
        let race = token.clone();
        let inner = Box::pin(async move {
            tokio::select! {
                biased;
                _ = race.canceled() => Err(Error::Canceled),
                result = future => result,
            }
        });
        Self {
            inner,
            handle: CancelHandle {
                token,
                cleanup: Arc::new(std::sync::Mutex::new(Some(Box::new(cleanup)))),
            },
        }
    }

    /// An already-settled result, for early-exit paths.
    pub fn ready(result: Result<T, Error>) -> Self {
        Self::new(std::future::ready(result))
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl<T> Future for Cancelable<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn one_shot_runs_to_completion() {
        let body = TaskBody::one_shot(|| async { Ok(()) });
        assert!(run_task(body.prime(), CancelToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn one_shot_cancel_interrupts_await() {
        let token = CancelToken::new();
        let body = TaskBody::one_shot(|| async {
            sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let task = tokio::spawn(run_task(body.prime(), token.clone()));
        sleep(Duration::from_millis(20)).await;
        token.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn stepped_runs_steps_in_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let steps: Vec<TaskFuture> = (0..3)
            .map(|i| {
                let counter = counter.clone();
                Box::pin(async move {
                    assert_eq!(counter.fetch_add(1, Ordering::SeqCst), i);
                    Ok(())
                }) as TaskFuture
            })
            .collect();
        run_task(TaskBody::steps(steps).prime(), CancelToken::new())
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stepped_cancel_stops_later_steps() {
        let counter = Arc::new(AtomicUsize::new(0));
        let token = CancelToken::new();
        let first = counter.clone();
        let second = counter.clone();
        let steps: Vec<TaskFuture> = vec![
            Box::pin(async move {
                first.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            Box::pin(async move {
                sleep(Duration::from_secs(60)).await;
                second.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            Box::pin(async { panic!("step after cancellation must not run") }),
        ];
        let task = tokio::spawn(run_task(TaskBody::steps(steps).prime(), token.clone()));
        sleep(Duration::from_millis(20)).await;
        token.cancel();
        token.cancel(); // idempotent
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Canceled)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stepped_error_propagates() {
        let steps: Vec<TaskFuture> = vec![
            Box::pin(async { Ok(()) }),
            Box::pin(async { Err(Error::Snapshot("bad page".into())) }),
            Box::pin(async { panic!("step after a failed step must not run") }),
        ];
        let result = run_task(TaskBody::steps(steps).prime(), CancelToken::new()).await;
        assert!(matches!(result, Err(Error::Snapshot(_))));
    }

    #[tokio::test]
    async fn cancelable_runs_cleanup_once() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let seen = cleanups.clone();
        let fut = Cancelable::with_cleanup(
            async {
                sleep(Duration::from_secs(60)).await;
                Ok(())
            },
            move || {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );
        let handle = fut.cancel_handle();
        let task = tokio::spawn(fut);
        sleep(Duration::from_millis(20)).await;
        handle.cancel();
        handle.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Canceled)));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelable_resolves_value() {
        let fut = Cancelable::new(async { Ok(7usize) });
        assert_eq!(fut.await.unwrap(), 7);
    }
}
