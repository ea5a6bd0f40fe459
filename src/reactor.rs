//! Reactor and completion dispatch.
//!
//! A [`Reactor`] is the Tokio runtime a connection's socket is registered
//! with. Completions are never invoked inline: they are handed to an
//! [`Executor`], either the reactor itself or a [`Strand`] that serializes
//! everything posted to it.

use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Unit of work handed to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs some time after they are submitted, never inside `execute`.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, job: Job);
}

// ============================================================================
// Reactor
// ============================================================================

/// Handle to the runtime that drives socket readiness.
#[derive(Debug, Clone)]
pub struct Reactor {
    handle: Handle,
}

impl Reactor {
    /// The reactor of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn current() -> Self {
        Self::from_handle(Handle::current())
    }

    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::from_handle)
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `f` on the reactor as its own task.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move { f() });
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

impl Executor for Reactor {
    fn execute(&self, job: Job) {
        self.post(job);
    }
}

// ============================================================================
// Strand
// ============================================================================

thread_local! {
    /// Strand whose queue the current thread is draining, 0 for none.
    static CURRENT_STRAND: Cell<usize> = const { Cell::new(0) };
}

/// Serialized executor: jobs posted to the same strand run one at a time, in
/// submission order, on the strand's reactor.
#[derive(Clone)]
pub struct Strand {
    inner: Arc<StrandInner>,
}

struct StrandInner {
    reactor: Reactor,
    queue: Mutex<StrandQueue>,
}

#[derive(Default)]
struct StrandQueue {
    jobs: VecDeque<Job>,
    /// A drain task is scheduled or running
    running: bool,
}

impl Strand {
    pub fn new(reactor: Reactor) -> Self {
        Self {
            inner: Arc::new(StrandInner {
                reactor,
                queue: Mutex::new(StrandQueue::default()),
            }),
        }
    }

    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    /// True while the calling thread is running a job of this strand.
    pub fn running_in_this_thread(&self) -> bool {
        CURRENT_STRAND.with(|current| current.get() == self.inner.id())
    }

    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute(Box::new(f));
    }

    /// Jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().jobs.len()
    }
}

impl Executor for Strand {
    fn execute(&self, job: Job) {
        let schedule = {
            let mut queue = self.inner.queue.lock();
            queue.jobs.push_back(job);
            !std::mem::replace(&mut queue.running, true)
        };
        if schedule {
            StrandInner::schedule(Arc::clone(&self.inner));
        }
    }
}

impl std::fmt::Debug for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl StrandInner {
    fn id(&self) -> usize {
        self as *const StrandInner as usize
    }

    fn schedule(inner: Arc<StrandInner>) {
        let reactor = inner.reactor.clone();
        reactor.post(move || StrandInner::drain(inner));
    }

    fn drain(inner: Arc<StrandInner>) {
        let _current = EnterStrand::new(inner.id());
        let _finish = FinishDrain(&inner);
        loop {
            let job = inner.queue.lock().jobs.pop_front();
            match job {
                Some(job) => job(),
                None => break,
            }
        }
    }
}

/// Marks the current thread as running a strand.
struct EnterStrand {
    previous: usize,
}

impl EnterStrand {
    fn new(id: usize) -> Self {
        Self {
            previous: CURRENT_STRAND.with(|current| current.replace(id)),
        }
    }
}

impl Drop for EnterStrand {
    fn drop(&mut self) {
        CURRENT_STRAND.with(|current| current.set(self.previous));
    }
}

/// Clears `running`, or reschedules when jobs arrived meanwhile or a job
/// panicked with work still queued.
struct FinishDrain<'a>(&'a Arc<StrandInner>);

impl Drop for FinishDrain<'_> {
    fn drop(&mut self) {
        let mut queue = self.0.queue.lock();
        if queue.jobs.is_empty() {
            queue.running = false;
        } else {
            drop(queue);
            StrandInner::schedule(Arc::clone(self.0));
        }
    }
}

// ============================================================================
// Completion
// ============================================================================

/// A handler bound to the executor it must run on.
pub struct Completion<F> {
    executor: Arc<dyn Executor>,
    handler: F,
}

impl<F> Completion<F> {
    pub fn new(executor: Arc<dyn Executor>, handler: F) -> Self {
        Self { executor, handler }
    }

    /// Bind `handler` to `executor`.
    pub fn on<E: Executor>(executor: E, handler: F) -> Self {
        Self::new(Arc::new(executor), handler)
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Deliver `value` to the handler through the bound executor.
    pub fn complete<T>(self, value: T)
    where
        F: FnOnce(T) + Send + 'static,
        T: Send + 'static,
    {
        let handler = self.handler;
        self.executor.execute(Box::new(move || handler(value)));
    }
}

impl<F> std::fmt::Debug for Completion<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn test_reactor_post_is_deferred() {
        let reactor = Reactor::current();
        let ran = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();

        let flag = Arc::clone(&ran);
        reactor.post(move || {
            flag.store(true, Ordering::SeqCst);
            let _ = tx.send(());
        });
        assert!(!ran.load(Ordering::SeqCst));

        rx.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_strand_runs_jobs_in_order_one_at_a_time() {
        let strand = Strand::new(Reactor::current());
        let order = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);

        for i in 0..100 {
            let order = Arc::clone(&order);
            let active = Arc::clone(&active);
            let check = strand.clone();
            let done = if i == 99 { tx.take() } else { None };
            strand.post(move || {
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                assert!(check.running_in_this_thread());
                order.lock().push(i);
                active.fetch_sub(1, Ordering::SeqCst);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            });
        }

        rx.await.unwrap();
        assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
        assert!(!strand.running_in_this_thread());
    }

    #[tokio::test]
    async fn test_completion_runs_on_executor() {
        let strand = Strand::new(Reactor::current());
        let (tx, rx) = oneshot::channel();

        let check = strand.clone();
        let completion = Completion::on(strand.clone(), move |value: u32| {
            let _ = tx.send((value, check.running_in_this_thread()));
        });
        completion.complete(7);

        assert_eq!(rx.await.unwrap(), (7, true));
    }
}
