//! Execution contexts that promise work and observer callbacks run on.
//!
//! An [`Executor`] accepts tasks and runs them at some later point. Two are
//! provided:
//!
//! - [`Inline`] runs the task immediately on the submitting thread.
//! - [`WorkQueue`] is a named pool of worker threads fed through a channel.
//!
//! Code running on a work queue sees that queue as its [`current`] context,
//! which is what `Promise::then` uses when no context is given. Outside of
//! any work queue the current context is [`Inline`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

/// A unit of work submitted to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run tasks.
///
/// Implementations must not run the task while holding locks the task could
/// need, and must be callable from any thread.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Runs each task synchronously on the caller's thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inline;

impl Executor for Inline {
    fn execute(&self, task: Task) {
        task();
    }
}

thread_local! {
    static CURRENT_QUEUE: RefCell<Option<Weak<QueueShared>>> = const { RefCell::new(None) };
}

/// The execution context of the calling thread.
///
/// On a [`WorkQueue`] worker this is that queue; anywhere else it is
/// [`Inline`].
#[must_use]
pub fn current() -> Arc<dyn Executor> {
    let queue = CURRENT_QUEUE.with(|slot| slot.borrow().as_ref().and_then(Weak::upgrade));
    match queue {
        Some(shared) => Arc::new(WorkQueue { shared }),
        None => Arc::new(Inline),
    }
}

struct QueueShared {
    name: String,
    sender: Sender<Task>,
    workers: usize,
}

/// A named pool of worker threads.
///
/// Cloning a `WorkQueue` yields another handle to the same pool. Workers
/// exit once every handle has been dropped and the pending tasks are drained.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<QueueShared>,
}

impl WorkQueue {
    /// Spawn a queue with `workers` threads (at least one).
    ///
    /// Worker threads are named `{name}-{index}`.
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        let name = name.into();
        let workers = workers.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();

        let shared = Arc::new(QueueShared {
            name: name.clone(),
            sender,
            workers,
        });

        for index in 0..workers {
            let receiver = receiver.clone();
            let weak = Arc::downgrade(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || run_worker(&receiver, &weak));
            if let Err(e) = spawned {
                tracing::error!(queue = %name, index, "Failed to spawn worker thread: {e}");
            }
        }

        Self { shared }
    }

    /// A single-worker queue. Tasks run one at a time in submission order.
    pub fn serial(name: impl Into<String>) -> Self {
        Self::new(name, 1)
    }

    /// The process-wide queue for short-lived background work.
    pub fn common() -> Self {
        static COMMON: OnceLock<WorkQueue> = OnceLock::new();
        COMMON
            .get_or_init(|| {
                let workers = thread::available_parallelism().map_or(4, |n| n.get().max(2));
                WorkQueue::new("roundabout-common", workers)
            })
            .clone()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.shared.workers
    }

    /// True when called from one of this queue's worker threads.
    #[must_use]
    pub fn is_current(&self) -> bool {
        CURRENT_QUEUE.with(|slot| {
            slot.borrow()
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|shared| Arc::ptr_eq(&shared, &self.shared))
        })
    }

    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        self.execute(Box::new(f));
    }
}

impl Executor for WorkQueue {
    fn execute(&self, task: Task) {
        if self.shared.sender.send(task).is_err() {
            // Only possible when every worker failed to spawn.
            tracing::error!(queue = %self.shared.name, "Work queue has no workers; task dropped");
        }
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.shared.name)
            .field("workers", &self.shared.workers)
            .finish()
    }
}

fn run_worker(receiver: &Receiver<Task>, queue: &Weak<QueueShared>) {
    CURRENT_QUEUE.with(|slot| *slot.borrow_mut() = Some(queue.clone()));
    while let Ok(task) = receiver.recv() {
        task();
    }
    CURRENT_QUEUE.with(|slot| slot.borrow_mut().take());
}

/// Named work queues shared across an application.
///
/// Unknown names get a new queue with the manager's default worker count.
#[derive(Debug)]
pub struct QueueManager {
    queues: Mutex<HashMap<String, WorkQueue>>,
    default_workers: usize,
}

impl QueueManager {
    pub fn new(default_workers: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            default_workers: default_workers.max(1),
        }
    }

    /// Register a specially configured queue under `name`, replacing any other.
    pub fn set_shared_queue(&self, name: impl Into<String>, queue: WorkQueue) {
        self.queues.lock().insert(name.into(), queue);
    }

    /// The queue registered under `name`, created on first use.
    pub fn shared_queue(&self, name: &str) -> WorkQueue {
        self.queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| WorkQueue::new(name, self.default_workers))
            .clone()
    }

    /// The catch-all queue for short-lived background tasks.
    pub fn common_work_queue(&self) -> WorkQueue {
        self.shared_queue("common")
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new(4)
    }
}
