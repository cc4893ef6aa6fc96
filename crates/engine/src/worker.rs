//! Per-connection serialized job queue.
//!
//! Every connection owns one worker thread and runs all of its work, from
//! user transactions to changeset application, as jobs on that thread in
//! submission order. The FIFO ordering is what lets async and sync
//! transactions interleave safely on one connection, and what guarantees a
//! fanned-out changeset is applied before any transaction submitted after the
//! commit that produced it.
//!
//! The worker owns its state outright; jobs get `&mut S` and nothing else
//! ever touches it.

use parking_lot::{Condvar, Mutex as ParkingMutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use tracing::error;

pub(crate) type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

struct QueueShared<S> {
    jobs: ParkingMutex<VecDeque<Job<S>>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
}

/// Cheap pusher handle held by the database's connection registry for
/// changeset fan-out. Does not keep the worker alive.
pub(crate) struct QueueHandle<S> {
    shared: Arc<QueueShared<S>>,
}

impl<S> Clone for QueueHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> QueueHandle<S> {
    /// Enqueues a job unless the queue has shut down. Returns whether the
    /// job was accepted.
    pub(crate) fn try_push(&self, job: Job<S>) -> bool {
        if self.shared.shutdown.load(AtomicOrdering::Acquire) {
            return false;
        }
        {
            let mut jobs = self.shared.jobs.lock();
            jobs.push_back(job);
        }
        self.shared.work_ready.notify_one();
        true
    }
}

/// A single worker thread draining a FIFO job queue against owned state.
pub(crate) struct SerialQueue<S: Send + 'static> {
    shared: Arc<QueueShared<S>>,
    worker: Option<JoinHandle<()>>,
    worker_thread: ThreadId,
}

impl<S: Send + 'static> SerialQueue<S> {
    /// Spawns the worker thread, moving `state` into it.
    pub(crate) fn spawn(name: String, state: S) -> Self {
        let shared = Arc::new(QueueShared {
            jobs: ParkingMutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(&worker_shared, state))
            .expect("failed to spawn connection worker thread");
        let worker_thread = worker.thread().id();
        Self {
            shared,
            worker: Some(worker),
            worker_thread,
        }
    }

    /// Pusher handle for fan-out.
    pub(crate) fn handle(&self) -> QueueHandle<S> {
        QueueHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// True when called from the worker thread itself.
    ///
    /// Submitting a blocking job from the worker would deadlock; callers use
    /// this to fail fast instead.
    pub(crate) fn is_worker_thread(&self) -> bool {
        std::thread::current().id() == self.worker_thread
    }

    /// Enqueues a fire-and-forget job.
    pub(crate) fn push(&self, job: Job<S>) {
        assert!(
            !self.shared.shutdown.load(AtomicOrdering::Acquire),
            "job submitted to a connection that is shutting down"
        );
        {
            let mut jobs = self.shared.jobs.lock();
            jobs.push_back(job);
        }
        self.shared.work_ready.notify_one();
    }

    /// Runs `f` on the worker and blocks until it finishes.
    ///
    /// A panic inside `f` is re-raised on the calling thread.
    pub(crate) fn run_sync<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> T + Send + 'static,
    {
        assert!(
            !self.is_worker_thread(),
            "re-entrant blocking call on a connection worker thread"
        );
        let slot = Arc::new(SyncSlot::<T>::new());
        let job_slot = Arc::clone(&slot);
        self.push(Box::new(move |state| {
            let outcome = catch_unwind(AssertUnwindSafe(|| f(state)));
            job_slot.fill(outcome);
        }));
        slot.wait()
    }
}

impl<S: Send + 'static> Drop for SerialQueue<S> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, AtomicOrdering::Release);

        // Lock the queue before notifying to prevent lost-wakeup: a worker
        // between its shutdown check and condvar wait holds this lock, so
        // acquiring it guarantees the worker is either already in wait()
        // (and our notify will wake it) or hasn't checked shutdown yet
        // (and will see it's true when it does).
        {
            let _jobs = self.shared.jobs.lock();
            self.shared.work_ready.notify_all();
        }

        if let Some(worker) = self.worker.take() {
            // A queue dropped from its own worker thread (a job owned the
            // last reference) cannot join itself; the thread drains the
            // remaining jobs and exits on its own.
            if std::thread::current().id() != self.worker_thread {
                let _ = worker.join();
            }
        }
    }
}

/// One-shot result slot for `run_sync`.
struct SyncSlot<T> {
    value: ParkingMutex<Option<std::thread::Result<T>>>,
    ready: Condvar,
}

impl<T> SyncSlot<T> {
    fn new() -> Self {
        Self {
            value: ParkingMutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn fill(&self, outcome: std::thread::Result<T>) {
        let mut value = self.value.lock();
        *value = Some(outcome);
        self.ready.notify_all();
    }

    fn wait(&self) -> T {
        let mut value = self.value.lock();
        while value.is_none() {
            self.ready.wait(&mut value);
        }
        match value.take() {
            Some(Ok(v)) => v,
            Some(Err(panic)) => resume_unwind(panic),
            None => unreachable!(),
        }
    }
}

fn worker_loop<S>(shared: &QueueShared<S>, mut state: S) {
    loop {
        let job = {
            let mut jobs = shared.jobs.lock();
            loop {
                if let Some(job) = jobs.pop_front() {
                    break job;
                }
                if shared.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }
                shared.work_ready.wait(&mut jobs);
            }
        };

        // Execute outside the lock. Sync jobs catch their own panics and
        // forward them to the waiting caller; a panic that reaches this level
        // came from a detached job, and the state it worked on can no longer
        // be trusted (a half-applied changeset must not survive).
        if let Err(e) = catch_unwind(AssertUnwindSafe(|| job(&mut state))) {
            error!(
                "detached connection job panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
            std::process::abort();
        }
    }
}
