//! Priority task queue and worker pool (C7).
//!
//! Four priority classes, FIFO within a class; a bounded number of worker
//! threads drain the queue so callers (ingest, orchestrator) never run
//! inference synchronously (§5).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    priority: Priority,
    created_at: u64,
    job: Job,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.created_at == other.created_at
    }
}
impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    /// `(priority desc, created_at asc)` — `BinaryHeap` is a max-heap so a
    /// "greater" task here is one that should dequeue first.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.created_at.cmp(&self.created_at),
            ord => ord,
        }
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<Task>>,
    condvar: Condvar,
    shutting_down: AtomicBool,
    next_seq: AtomicU64,
}

/// Cooperative work queue ordered by `(priority desc, submission order asc)`.
#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<Shared>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                heap: Mutex::new(BinaryHeap::new()),
                condvar: Condvar::new(),
                shutting_down: AtomicBool::new(false),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn enqueue_fn(&self, priority: Priority, job: impl FnOnce() + Send + 'static) {
        if self.shared.shutting_down.load(AtomicOrdering::Acquire) {
            return;
        }
        let created_at = self.shared.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut heap = self.shared.heap.lock().unwrap();
        heap.push(Task { priority, created_at, job: Box::new(job) });
        self.shared.condvar.notify_one();
    }

    /// Returns a [`tokio::sync::oneshot::Receiver`] that resolves with the
    /// closure's return value once a worker executes it.
    pub fn enqueue_with_future<T, F>(&self, priority: Priority, job: F) -> tokio::sync::oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.enqueue_fn(priority, move || {
            let _ = tx.send(job());
        });
        rx
    }

    /// Blocks until a task is available or shutdown is signalled and the
    /// queue has drained.
    fn dequeue(&self) -> Option<Task> {
        let mut heap = self.shared.heap.lock().unwrap();
        loop {
            if let Some(task) = heap.pop() {
                return Some(task);
            }
            if self.shared.shutting_down.load(AtomicOrdering::Acquire) {
                return None;
            }
            heap = self.shared.condvar.wait(heap).unwrap();
        }
    }

    pub fn try_dequeue(&self) -> Option<()> {
        let mut heap = self.shared.heap.lock().unwrap();
        heap.pop().map(|task| (task.job)())
    }

    pub fn size(&self) -> usize {
        self.shared.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) {
        self.shared.heap.lock().unwrap().clear();
    }

    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, AtomicOrdering::Release);
        self.shared.condvar.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(AtomicOrdering::Acquire)
    }
}

/// Spawns N worker threads that loop `dequeue -> execute`, swallowing panics.
pub struct WorkerPool {
    queue: TaskQueue,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(queue: TaskQueue, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let q = queue.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("stt-worker-{idx}"))
                    .spawn(move || {
                        while let Some(task) = q.dequeue() {
                            let result = panic::catch_unwind(AssertUnwindSafe(task.job));
                            if let Err(panic) = result {
                                let msg = panic
                                    .downcast_ref::<&str>()
                                    .map(|s| s.to_string())
                                    .or_else(|| panic.downcast_ref::<String>().cloned())
                                    .unwrap_or_else(|| "unknown panic".to_string());
                                error!(worker = idx, %msg, "task panicked, worker continuing");
                            }
                        }
                    })
                    .expect("failed to spawn worker thread"),
            );
        }
        Self { queue, workers }
    }

    pub fn stop(self) {
        self.queue.shutdown();
        for w in self.workers {
            if w.join().is_err() {
                warn!("worker thread panicked while joining");
            }
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn same_priority_tasks_dequeue_fifo() {
        let q = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            q.enqueue_fn(Priority::Normal, move || order.lock().unwrap().push(i));
        }
        for _ in 0..4 {
            q.try_dequeue();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn critical_task_preempts_waiting_lower_priority() {
        let q = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let push = |q: &TaskQueue, order: Arc<Mutex<Vec<i32>>>, p: Priority, v: i32| {
            q.enqueue_fn(p, move || order.lock().unwrap().push(v));
        };
        push(&q, order.clone(), Priority::Low, 1);
        push(&q, order.clone(), Priority::High, 2);
        push(&q, order.clone(), Priority::Critical, 3);
        push(&q, order.clone(), Priority::Normal, 4);
        for _ in 0..4 {
            q.try_dequeue();
        }
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 4, 1]);
    }

    #[test]
    fn shutdown_makes_enqueue_a_no_op_and_drains() {
        let q = TaskQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = counter.clone();
            q.enqueue_fn(Priority::Normal, move || {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            });
        }
        q.shutdown();
        let counter2 = counter.clone();
        q.enqueue_fn(Priority::Normal, move || {
            counter2.fetch_add(100, AtomicOrdering::SeqCst);
        });
        assert_eq!(q.size(), 1); // the pre-shutdown task is still pending
        q.try_dequeue();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn worker_pool_executes_enqueued_tasks() {
        let q = TaskQueue::new();
        let pool = WorkerPool::start(q.clone(), 2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            q.enqueue_fn(Priority::Normal, move || {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            });
        }
        std::thread::sleep(Duration::from_millis(100));
        pool.stop();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 8);
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let q = TaskQueue::new();
        let pool = WorkerPool::start(q.clone(), 1);
        q.enqueue_fn(Priority::Normal, || panic!("boom"));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        q.enqueue_fn(Priority::Normal, move || {
            counter2.fetch_add(1, AtomicOrdering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        pool.stop();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn enqueue_with_future_delivers_return_value() {
        let q = TaskQueue::new();
        let pool = WorkerPool::start(q.clone(), 1);
        let rx = q.enqueue_with_future(Priority::Normal, || 21 * 2);
        let value = futures_lite_block_on(rx);
        pool.stop();
        assert_eq!(value, Some(42));
    }

    fn futures_lite_block_on<T>(rx: tokio::sync::oneshot::Receiver<T>) -> Option<T> {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(rx).ok()
    }
}
