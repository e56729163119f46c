//! ## eddy-core::thread::pool
//! **Fixed-size worker pools**
//!
//! A [`ThreadPool`] owns `count` workers, each with its own OS thread named
//! `<pool>-<index>`. The worker set never changes after `create`, so
//! `index`, `hash` and `round_robin` hand out references without locking.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::PoolError;

/// Per-thread view handed to [`Worker::run`].
#[derive(Debug, Clone)]
pub struct WorkerContext {
    index: usize,
    name: String,
    stop: Arc<AtomicBool>,
}

impl WorkerContext {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Per-thread state and body of one pool slot.
pub trait Worker: Send + Sync + 'static {
    /// Thread body; must return soon after `ctx.is_stopping()` turns true.
    fn run(&self, ctx: &WorkerContext);

    /// Called after the stop flag is set so a parked `run` re-checks it.
    fn wakeup(&self) {}
}

pub struct ThreadPool<W: Worker> {
    name: String,
    workers: Vec<Arc<W>>,
    stop: Arc<AtomicBool>,
    started: AtomicBool,
    cursor: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<W: Worker> ThreadPool<W> {
    /// Builds `count` workers with `make(index)`. No thread runs until `start`.
    pub fn create(
        name: impl Into<String>,
        count: usize,
        make: impl FnMut(usize) -> W,
    ) -> Result<Self, PoolError> {
        if count == 0 {
            return Err(PoolError::Empty);
        }
        Ok(Self {
            name: name.into(),
            workers: (0..count).map(make).map(Arc::new).collect(),
            stop: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            cursor: AtomicUsize::new(0),
            handles: Mutex::new(Vec::with_capacity(count)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> usize {
        self.workers.len()
    }

    pub fn index(&self, n: usize) -> Option<&Arc<W>> {
        self.workers.get(n)
    }

    /// Deterministic worker for `key`.
    pub fn hash(&self, key: u64) -> &Arc<W> {
        &self.workers[(key % self.workers.len() as u64) as usize]
    }

    /// Next worker in rotation over `start..count`; worker 0 when `start`
    /// leaves nothing to rotate over.
    pub fn round_robin(&self, start: usize) -> &Arc<W> {
        let count = self.workers.len();
        if count <= start {
            return &self.workers[0];
        }
        let n = self.cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        &self.workers[n % (count - start) + start]
    }

    pub fn workers(&self) -> impl Iterator<Item = &Arc<W>> {
        self.workers.iter()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Spawns one thread per worker.
    pub fn start(&self) -> Result<(), PoolError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(PoolError::AlreadyStarted);
        }

        let mut handles = self.handles.lock();
        for (index, worker) in self.workers.iter().enumerate() {
            let ctx = WorkerContext {
                index,
                name: format!("{}-{index}", self.name),
                stop: Arc::clone(&self.stop),
            };
            let worker = Arc::clone(worker);
            let spawned = thread::Builder::new()
                .name(ctx.name.clone())
                .spawn(move || {
                    debug!(thread = %ctx.name, "Worker thread running");
                    worker.run(&ctx);
                    debug!(thread = %ctx.name, "Worker thread exiting");
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(pool = %self.name, index, "Failed to spawn worker: {e}");
                    drop(handles);
                    self.stop();
                    self.join();
                    return Err(PoolError::Spawn(e));
                }
            }
        }
        info!(pool = %self.name, count = self.workers.len(), "Thread pool started");
        Ok(())
    }

    /// Signals every worker to finish. Does not wait.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            debug!(pool = %self.name, "Stopping thread pool");
        }
        for worker in &self.workers {
            worker.wakeup();
        }
    }

    /// Joins every started thread. Returns once all have exited.
    pub fn join(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_owned();
            if handle.join().is_err() {
                error!(thread = %name, "Worker thread panicked");
            }
        }
    }

    /// Alias of [`join`](Self::join).
    pub fn wait(&self) {
        self.join();
    }

    /// Stops and joins every worker.
    pub fn destroy(self) {}
}

impl<W: Worker> Drop for ThreadPool<W> {
    fn drop(&mut self) {
        if !self.handles.get_mut().is_empty() {
            self.stop();
            self.join();
        }
    }
}

impl<W: Worker> std::fmt::Debug for ThreadPool<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("count", &self.workers.len())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

pub type Job = Box<dyn FnOnce() + Send>;

enum Task {
    Run(Job),
    Wake,
}

/// Mailbox worker that runs submitted closures in order. On stop it drains
/// whatever is queued before exiting.
pub struct TaskWorker {
    tx: Sender<Task>,
    rx: Receiver<Task>,
    executed: AtomicUsize,
}

impl TaskWorker {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            executed: AtomicUsize::new(0),
        }
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(Task::Run(Box::new(job)));
    }

    /// Jobs queued and not yet started.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    fn execute(&self, job: Job, ctx: &WorkerContext) {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(thread = %ctx.name(), "Job panicked");
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for TaskWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for TaskWorker {
    fn run(&self, ctx: &WorkerContext) {
        while let Ok(task) = self.rx.recv() {
            match task {
                Task::Run(job) => self.execute(job, ctx),
                Task::Wake if ctx.is_stopping() => break,
                Task::Wake => {}
            }
        }
        while let Ok(task) = self.rx.try_recv() {
            if let Task::Run(job) = task {
                self.execute(job, ctx);
            }
        }
    }

    fn wakeup(&self) {
        let _ = self.tx.send(Task::Wake);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tracing_test::traced_test;

    struct Probe {
        id: usize,
        thread_name: Mutex<Option<String>>,
    }

    impl Worker for Probe {
        fn run(&self, ctx: &WorkerContext) {
            *self.thread_name.lock() = thread::current().name().map(str::to_owned);
            while !ctx.is_stopping() {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn probes(count: usize) -> ThreadPool<Probe> {
        ThreadPool::create("probe", count, |id| Probe {
            id,
            thread_name: Mutex::new(None),
        })
        .unwrap()
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(matches!(
            ThreadPool::create("none", 0, |_| TaskWorker::new()),
            Err(PoolError::Empty)
        ));
    }

    #[test]
    fn index_and_hash_address_fixed_slots() {
        let pool = probes(3);
        assert_eq!(pool.index(2).unwrap().id, 2);
        assert!(pool.index(3).is_none());
        assert_eq!(pool.hash(7).id, 1);
        assert_eq!(pool.hash(7).id, pool.hash(7).id);
    }

    #[test]
    fn round_robin_rotates_over_tail() {
        let pool = probes(3);
        let ids: Vec<usize> = (0..6).map(|_| pool.round_robin(0).id).collect();
        assert_eq!(ids, vec![1, 2, 0, 1, 2, 0]);

        let tail: Vec<usize> = (0..4).map(|_| pool.round_robin(1).id).collect();
        assert!(tail.iter().all(|&id| id == 1 || id == 2));
        assert_ne!(tail[0], tail[1]);

        assert_eq!(pool.round_robin(3).id, 0);
        assert_eq!(pool.round_robin(10).id, 0);
    }

    #[test]
    #[traced_test]
    fn threads_are_named_and_joined() {
        let pool = probes(2);
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(PoolError::AlreadyStarted)));
        assert!(logs_contain("Thread pool started"));

        while pool.workers().any(|w| w.thread_name.lock().is_none()) {
            thread::sleep(Duration::from_millis(1));
        }
        pool.stop();
        pool.join();
        let names: Vec<String> = pool
            .workers()
            .map(|w| w.thread_name.lock().clone().unwrap())
            .collect();
        assert_eq!(names, vec!["probe-0", "probe-1"]);
    }

    #[test]
    fn task_workers_drain_mailboxes_on_destroy() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::create("task", 2, |_| TaskWorker::new()).unwrap();
        pool.start().unwrap();
        for i in 0..200u64 {
            let counter = Arc::clone(&counter);
            pool.hash(i).submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.destroy();
        assert_eq!(counter.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn jobs_on_one_worker_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pool = ThreadPool::create("order", 1, |_| TaskWorker::new()).unwrap();
        pool.start().unwrap();
        for i in 0..50 {
            let seen = Arc::clone(&seen);
            pool.hash(0).submit(move || seen.lock().push(i));
        }
        pool.stop();
        pool.join();
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::create("panic", 1, |_| TaskWorker::new()).unwrap();
        pool.start().unwrap();
        let worker = Arc::clone(pool.hash(0));
        worker.submit(|| panic!("boom"));
        let c = Arc::clone(&counter);
        worker.submit(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        pool.destroy();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(worker.executed(), 2);
    }
}
