//! Priority task queue with per-task cancellation.
//!
//! Tasks are keyed by a stable string id; at most `concurrency` run at once.
//! Selection scans the queue in insertion order preferring lower numeric
//! priorities (a missing priority ranks last), and the `@@/flush` sentinel
//! acts as a barrier: nothing enqueued after it is promoted ahead of it.
//!
//! All queue state lives behind one mutex that is never held across an
//! await. Completion and the promotion of successors happen under a single
//! lock acquisition, so an observer can never catch the queue with an empty
//! pending set while promotable work is still queued.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::error::Error;
use crate::task::{run_task, CancelToken, Cancelable, TaskBody, TaskResult, TaskWork};

/// Sentinel id used as the flush barrier.
pub const FLUSH_TASK_ID: &str = "@@/flush";

/// Ids with this prefix are accepted even on a closed queue.
const SENTINEL_PREFIX: &str = "@@/";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct QueuedTask {
    id: String,
    priority: Option<i32>,
    body: TaskBody,
    token: CancelToken,
    done: oneshot::Sender<TaskResult>,
}

struct PendingTask {
    token: CancelToken,
}

struct State {
    running: bool,
    closed: bool,
    concurrency: usize,
    queued: Vec<QueuedTask>,
    pending: HashMap<String, PendingTask>,
}

/// The future returned by [`Queue::push`].
///
/// Resolves with the task result; rejects with [`Error::Canceled`] when the
/// task is canceled, replaced by a newer push of the same id, or dropped by
/// `clear`/`close`. `cancel()` targets exactly this task instance; a newer
/// task that reused the id is unaffected.
pub struct TaskHandle {
    id: String,
    token: CancelToken,
    rx: oneshot::Receiver<TaskResult>,
    state: Weak<Mutex<State>>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let settled = {
            let mut st = state.lock().unwrap();
            if let Some(p) = st.pending.get(&self.id) {
                if p.token.same_as(&self.token) {
                    st.pending.remove(&self.id);
                }
            }
            st.queued
                .iter()
                .position(|t| t.token.same_as(&self.token))
                .map(|idx| st.queued.remove(idx))
        };
        if let Some(task) = settled {
            let _ = task.done.send(Err(Error::Canceled));
        }
        schedule(&state);
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }
}

impl Future for TaskHandle {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without settling: the task was torn down.
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Canceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Id-keyed priority queue running up to `concurrency` tasks at once.
///
/// Clones share the same underlying state.
#[derive(Clone)]
pub struct Queue {
    name: &'static str,
    state: Arc<Mutex<State>>,
}

impl Queue {
    pub fn new(name: &'static str, concurrency: usize) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(State {
                running: true,
                closed: false,
                concurrency: concurrency.max(1),
                queued: Vec::new(),
                pending: HashMap::new(),
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue a task, canceling any existing task with the same id.
    ///
    /// Returns `None` exactly when the queue is closed and `id` is not an
    /// `@@/` sentinel; the call is then silently dropped.
    pub fn push(
        &self,
        id: impl Into<String>,
        body: TaskBody,
        priority: Option<i32>,
    ) -> Option<TaskHandle> {
        let id = id.into();
        self.cancel(&id);

        let (done, rx) = oneshot::channel();
        let token = CancelToken::new();
        {
            let mut st = self.state.lock().unwrap();
            if st.closed && !id.starts_with(SENTINEL_PREFIX) {
                trace!(queue = self.name, id, "dropping push on closed queue");
                return None;
            }
            st.queued.push(QueuedTask {
                id: id.clone(),
                priority,
                body,
                token: token.clone(),
                done,
            });
        }
        schedule(&self.state);

        Some(TaskHandle {
            id,
            token,
            rx,
            state: Arc::downgrade(&self.state),
        })
    }

    /// Cancel the task with this id, wherever it currently lives.
    ///
    /// Pending tasks are signaled and removed from bookkeeping immediately;
    /// the in-flight computation observes the cancellation at its next
    /// suspension point. Idempotent.
    pub fn cancel(&self, id: &str) {
        let settled = {
            let mut st = self.state.lock().unwrap();
            if let Some(p) = st.pending.remove(id) {
                p.token.cancel();
                debug!(queue = self.name, id, "canceled pending task");
            }
            st.queued
                .iter()
                .position(|t| t.id == id)
                .map(|idx| st.queued.remove(idx))
        };
        if let Some(task) = settled {
            task.token.cancel();
            let _ = task.done.send(Err(Error::Canceled));
            debug!(queue = self.name, id, "canceled queued task");
        }
        schedule(&self.state);
    }

    /// True iff the id is currently queued or pending.
    pub fn has(&self, id: &str) -> bool {
        let st = self.state.lock().unwrap();
        st.pending.contains_key(id) || st.queued.iter().any(|t| t.id == id)
    }

    /// Drop every queued task (their futures reject canceled); pending tasks
    /// keep running. Returns the prior total size.
    pub fn clear(&self) -> usize {
        let (dropped, size) = {
            let mut st = self.state.lock().unwrap();
            let size = st.queued.len() + st.pending.len();
            (std::mem::take(&mut st.queued), size)
        };
        for task in dropped {
            task.token.cancel();
            let _ = task.done.send(Err(Error::Canceled));
        }
        size
    }

    pub fn size(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.queued.len() + st.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().unwrap().queued.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Start promoting queued tasks up to capacity.
    pub fn run(&self) -> &Self {
        self.state.lock().unwrap().running = true;
        schedule(&self.state);
        self
    }

    /// Stop promotions. Pending tasks are not canceled.
    pub fn stop(&self) -> &Self {
        self.state.lock().unwrap().running = false;
        self
    }

    /// Accept pushes again.
    pub fn open(&self) -> &Self {
        self.state.lock().unwrap().closed = false;
        self
    }

    /// Refuse further non-sentinel pushes. With `abort`, also stop the
    /// queue, drop everything queued, and cancel everything pending.
    pub fn close(&self, abort: bool) -> &Self {
        let aborted = {
            let mut st = self.state.lock().unwrap();
            st.closed = true;
            if abort {
                st.running = false;
                let queued = std::mem::take(&mut st.queued);
                let pending: Vec<_> = st.pending.drain().map(|(_, p)| p.token).collect();
                Some((queued, pending))
            } else {
                None
            }
        };
        if let Some((queued, pending)) = aborted {
            debug!(
                queue = self.name,
                queued = queued.len(),
                pending = pending.len(),
                "aborting queue"
            );
            for task in queued {
                task.token.cancel();
                let _ = task.done.send(Err(Error::Canceled));
            }
            for token in pending {
                token.cancel();
            }
        }
        self
    }

    /// Adjust capacity; newly-freed slots promote immediately.
    pub fn set_concurrency(&self, concurrency: usize) {
        self.state.lock().unwrap().concurrency = concurrency.max(1);
        schedule(&self.state);
    }

    /// Wait until no task is pending, polling every 10 ms.
    pub async fn idle(&self) {
        self.idle_with(|_| {}).await
    }

    /// Like [`idle`](Self::idle), invoking `cb(pending)` on every poll.
    pub async fn idle_with(&self, mut cb: impl FnMut(usize)) {
        loop {
            let pending = self.pending_count();
            cb(pending);
            if pending == 0 {
                return;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until the queue holds nothing at all, polling every 10 ms.
    pub async fn empty(&self) {
        self.empty_with(|_| {}).await
    }

    /// Like [`empty`](Self::empty), invoking `cb(size)` on every poll.
    pub async fn empty_with(&self, mut cb: impl FnMut(usize)) {
        loop {
            let size = self.size();
            cb(size);
            if size == 0 {
                return;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Run everything currently enqueued to completion.
    ///
    /// Ensures the queue is running, enqueues the `@@/flush` barrier (whose
    /// body restores a previously-stopped queue), and waits for the pending
    /// set to drain. Canceling the returned future cancels the barrier and
    /// restores the prior running state.
    pub fn flush(&self) -> Cancelable<()> {
        self.flush_with(|_| {})
    }

    /// Like [`flush`](Self::flush); `cb` receives, on every poll, the
    /// pending count plus the number of queued tasks ahead of the barrier.
    pub fn flush_with(&self, mut cb: impl FnMut(usize) + Send + 'static) -> Cancelable<()> {
        let was_stopped = !self.is_running();
        self.run();

        let restore = self.clone();
        self.push(
            FLUSH_TASK_ID,
            TaskBody::one_shot(move || async move {
                if was_stopped {
                    restore.stop();
                }
                Ok(())
            }),
            None,
        );

        let queue = self.clone();
        let fut = async move {
            loop {
                let count = {
                    let st = queue.state.lock().unwrap();
                    let ahead = st
                        .queued
                        .iter()
                        .position(|t| t.id == FLUSH_TASK_ID)
                        .unwrap_or(0);
                    st.pending.len() + ahead
                };
                cb(count);
                if queue.pending_count() == 0 {
                    return Ok(());
                }
                sleep(POLL_INTERVAL).await;
            }
        };

        let cleanup = self.clone();
        Cancelable::with_cleanup(fut, move || {
            cleanup.cancel(FLUSH_TASK_ID);
            if was_stopped {
                cleanup.stop();
            } else {
                cleanup.run();
            }
        })
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock().unwrap();
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("running", &st.running)
            .field("closed", &st.closed)
            .field("concurrency", &st.concurrency)
            .field("queued", &st.queued.len())
            .field("pending", &st.pending.len())
            .finish()
    }
}

/// Promote tasks one at a time while capacity allows.
///
/// Bookkeeping (queued → pending) happens under the lock; the task callback
/// is then invoked with the lock released before the queue is examined
/// again. The callback is the task's synchronous segment: a body that
/// stops its own queue (like the build-creation task) takes effect before
/// any further promotion.
fn schedule(state: &Arc<Mutex<State>>) {
    loop {
        let Some(task) = promote_one(&mut state.lock().unwrap()) else {
            return;
        };
        prime_and_spawn(state.clone(), task);
    }
}

fn promote_one(st: &mut State) -> Option<QueuedTask> {
    if !st.running || st.pending.len() >= st.concurrency || st.queued.is_empty() {
        return None;
    }
    let idx = next_index(&st.queued)?;
    let task = st.queued.remove(idx);
    st.pending.insert(
        task.id.clone(),
        PendingTask {
            token: task.token.clone(),
        },
    );
    Some(task)
}

fn prime_and_spawn(state: Arc<Mutex<State>>, task: QueuedTask) {
    let QueuedTask {
        id, body, token, done, ..
    } = task;
    let work = if token.is_canceled() {
        // Canceled between promotion and priming; skip the callback.
        TaskWork::Future(Box::pin(std::future::ready(Err(Error::Canceled))))
    } else {
        body.prime()
    };
    spawn_task(state, id, work, token, done);
}

/// Selection rule: scan in insertion order keeping the best candidate.
/// Numeric priorities outrank missing ones, lower numbers win, ties keep
/// the earlier task. Scanning stops at the `@@/flush` barrier, so nothing
/// enqueued after it may be promoted ahead of it.
fn next_index(queued: &[QueuedTask]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, task) in queued.iter().enumerate() {
        match best {
            None => best = Some(idx),
            Some(b) => {
                let current = queued[b].priority;
                if let Some(p) = task.priority {
                    if current.map_or(true, |c| p < c) {
                        best = Some(idx);
                    }
                }
            }
        }
        if task.id == FLUSH_TASK_ID {
            break;
        }
    }
    best
}

fn spawn_task(
    state: Arc<Mutex<State>>,
    id: String,
    work: TaskWork,
    token: CancelToken,
    done: oneshot::Sender<TaskResult>,
) {
    tokio::spawn(async move {
        let result = run_task(work, token.clone()).await;

        // Remove this task and promote one successor under a single lock
        // acquisition, so no observer catches an empty pending set while
        // promotable work is still queued.
        let next = {
            let mut st = state.lock().unwrap();
            if !token.is_canceled() {
                // A canceled task was already removed; guard against a newer
                // task that reused the id while this one was finishing.
                let owns_slot = st
                    .pending
                    .get(&id)
                    .map_or(false, |p| p.token.same_as(&token));
                if owns_slot {
                    st.pending.remove(&id);
                }
            }
            promote_one(&mut st)
        };

        let _ = done.send(result);
        if let Some(task) = next {
            prime_and_spawn(state.clone(), task);
        }
        // Fill any remaining free slots.
        schedule(&state);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    fn recording_task(
        log: &Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
        delay: Duration,
    ) -> TaskBody {
        let log = log.clone();
        TaskBody::one_shot(move || async move {
            sleep(delay).await;
            log.lock().unwrap().push(label);
            Ok(())
        })
    }

    #[tokio::test]
    async fn completion_respects_priority_and_latency() {
        // Queue(1): a(50ms), b(10ms), c(10ms, priority -1) completes a, c, b.
        let q = Queue::new("test", 1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = q
            .push("a", recording_task(&log, "a", Duration::from_millis(50)), None)
            .unwrap();
        let b = q
            .push("b", recording_task(&log, "b", Duration::from_millis(10)), None)
            .unwrap();
        let c = q
            .push(
                "c",
                recording_task(&log, "c", Duration::from_millis(10)),
                Some(-1),
            )
            .unwrap();
        a.await.unwrap();
        c.await.unwrap();
        b.await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn no_id_in_both_maps_and_pending_bounded() {
        let q = Queue::new("test", 2);
        for i in 0..6 {
            let id = format!("task/{i}");
            q.push(
                id,
                TaskBody::one_shot(|| async {
                    sleep(Duration::from_millis(20)).await;
                    Ok(())
                }),
                None,
            )
            .unwrap();
        }
        for _ in 0..10 {
            {
                let st = q.state.lock().unwrap();
                assert!(st.pending.len() <= st.concurrency);
                for t in &st.queued {
                    assert!(!st.pending.contains_key(&t.id));
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
        q.idle().await;
    }

    #[tokio::test]
    async fn push_eventually_invokes_callback() {
        let q = Queue::new("test", 1);
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = ran.clone();
        let handle = q
            .push(
                "only",
                TaskBody::one_shot(move || async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                None,
            )
            .unwrap();
        handle.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replacing_push_cancels_predecessor() {
        let q = Queue::new("test", 1);
        q.stop();
        let runs = Arc::new(AtomicUsize::new(0));
        let first_runs = runs.clone();
        let first = q
            .push(
                "dup",
                TaskBody::one_shot(move || async move {
                    first_runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                None,
            )
            .unwrap();
        let second_runs = runs.clone();
        let second = q
            .push(
                "dup",
                TaskBody::one_shot(move || async move {
                    second_runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                None,
            )
            .unwrap();
        q.run();
        assert!(matches!(first.await, Err(Error::Canceled)));
        second.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(q.size(), 0);
    }

    #[tokio::test]
    async fn numeric_priority_outranks_missing() {
        let q = Queue::new("test", 1);
        q.stop();
        let log = Arc::new(Mutex::new(Vec::new()));
        q.push("b", recording_task(&log, "b", Duration::ZERO), None)
            .unwrap();
        let a = q
            .push("a", recording_task(&log, "a", Duration::ZERO), Some(1))
            .unwrap();
        q.run();
        a.await.unwrap();
        q.idle().await;
        assert_eq!(log.lock().unwrap().first(), Some(&"a"));
    }

    #[tokio::test]
    async fn flush_barrier_blocks_later_tasks() {
        let q = Queue::new("test", 1);
        let log = Arc::new(Mutex::new(Vec::new()));
        q.push("early", recording_task(&log, "early", Duration::from_millis(10)), None)
            .unwrap();
        let flush = q.flush();
        // Enqueued after the barrier, with a priority that would otherwise win.
        let late = q
            .push("late", recording_task(&log, "late", Duration::ZERO), Some(0))
            .unwrap();
        flush.await.unwrap();
        late.await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["early", "late"]);
    }

    #[tokio::test]
    async fn flush_runs_a_stopped_queue() {
        let q = Queue::new("test", 2);
        q.stop();
        let log = Arc::new(Mutex::new(Vec::new()));
        q.push("x", recording_task(&log, "x", Duration::from_millis(5)), None)
            .unwrap();
        q.push("y", recording_task(&log, "y", Duration::from_millis(5)), None)
            .unwrap();
        q.flush().await.unwrap();
        let mut seen = log.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["x", "y"]);
        // The barrier restores the prior stopped state.
        assert!(!q.is_running());
    }

    #[tokio::test]
    async fn flush_progress_counts_work_ahead() {
        let q = Queue::new("test", 1);
        q.stop();
        q.push(
            "slow",
            TaskBody::one_shot(|| async {
                sleep(Duration::from_millis(30)).await;
                Ok(())
            }),
            None,
        )
        .unwrap();
        let counts = Arc::new(Mutex::new(Vec::new()));
        let seen = counts.clone();
        q.flush_with(move |n| seen.lock().unwrap().push(n))
            .await
            .unwrap();
        let counts = counts.lock().unwrap();
        // First poll sees the slow task pending and the barrier queued behind
        // it; the final poll sees an empty queue.
        assert!(counts.first().map_or(false, |&n| n >= 1));
        assert_eq!(counts.last(), Some(&0));
    }

    #[tokio::test]
    async fn canceling_flush_restores_running_state() {
        let q = Queue::new("test", 1);
        q.stop();
        q.push(
            "slow",
            TaskBody::one_shot(|| async {
                sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
            None,
        )
        .unwrap();
        let flush = q.flush();
        let handle = flush.cancel_handle();
        let waiter = tokio::spawn(flush);
        sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Canceled)));
        assert!(!q.has(FLUSH_TASK_ID));
        assert!(!q.is_running());
    }

    #[tokio::test]
    async fn close_abort_drops_queued_futures() {
        let q = Queue::new("test", 1);
        q.stop();
        let queued = q
            .push("queued", TaskBody::one_shot(|| async { Ok(()) }), None)
            .unwrap();
        q.close(true);
        assert!(matches!(queued.await, Err(Error::Canceled)));
        assert!(q
            .push("dropped", TaskBody::one_shot(|| async { Ok(()) }), None)
            .is_none());
        // Sentinels remain immune to the closed-queue drop.
        assert!(q
            .push("@@/probe", TaskBody::one_shot(|| async { Ok(()) }), None)
            .is_some());
        assert_eq!(q.queued_count(), 1);
    }

    #[tokio::test]
    async fn clear_leaves_pending_running() {
        let q = Queue::new("test", 1);
        let done = Arc::new(AtomicUsize::new(0));
        let seen = done.clone();
        let pending = q
            .push(
                "pending",
                TaskBody::one_shot(move || async move {
                    sleep(Duration::from_millis(30)).await;
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                None,
            )
            .unwrap();
        let queued = q
            .push("queued", TaskBody::one_shot(|| async { Ok(()) }), None)
            .unwrap();
        sleep(Duration::from_millis(5)).await;
        assert_eq!(q.clear(), 2);
        assert!(matches!(queued.await, Err(Error::Canceled)));
        pending.await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_mid_step_drains_pending() {
        let q = Queue::new("test", 1);
        let steps: Vec<crate::task::TaskFuture> = vec![
            Box::pin(async { Ok(()) }),
            Box::pin(async {
                sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
            Box::pin(async { Ok(()) }),
        ];
        let handle = q.push("stepped", TaskBody::steps(steps), None).unwrap();
        sleep(Duration::from_millis(20)).await;
        q.cancel("stepped");
        assert!(matches!(handle.await, Err(Error::Canceled)));
        assert_eq!(q.pending_count(), 0);
        assert_eq!(q.size(), 0);
    }

    #[tokio::test]
    async fn handle_cancel_spares_replacement() {
        let q = Queue::new("test", 1);
        q.stop();
        let first = q
            .push("name", TaskBody::one_shot(|| async { Ok(()) }), None)
            .unwrap();
        let second = q
            .push("name", TaskBody::one_shot(|| async { Ok(()) }), None)
            .unwrap();
        // Canceling the stale handle must not touch the replacement.
        first.cancel();
        assert!(q.has("name"));
        q.run();
        second.await.unwrap();
    }

    #[tokio::test]
    async fn stop_halts_promotions() {
        let q = Queue::new("test", 1);
        q.stop();
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = ran.clone();
        q.push(
            "later",
            TaskBody::one_shot(move || async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            None,
        )
        .unwrap();
        sleep(Duration::from_millis(30)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(q.queued_count(), 1);
        q.run();
        q.empty_with(|_| {}).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
