//! Hot Thread Pool
//!
//! Fixed set of workers fed in two ways:
//! - direct hand-off over a zero-capacity channel, which only succeeds when
//!   some worker is parked waiting
//! - a backlog channel, used when every worker is busy and the caller
//!   allows queuing
//!
//! A worker that finishes a task drains the backlog before parking again.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use crossbeam::select;
use parking_lot::Mutex;
use tracing::{debug, error};

/// Unit of background work
pub trait ThreadTask: Send {
    fn run(&mut self);

    /// Queue the task again after `run` returns
    fn resubmit(&self) -> bool {
        false
    }
}

pub type BoxedTask = Box<dyn ThreadTask>;

/// Counters of how work reached the workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub direct: u64,
    pub queued: u64,
    pub dequeued: u64,
    /// Resubmissions refused because the pool was shutting down
    pub dropped_resubmits: u64,
}

struct Senders {
    direct: Sender<BoxedTask>,
    backlog: Sender<BoxedTask>,
}

struct PoolInner {
    name: String,
    senders: Mutex<Option<Senders>>,
    queue_len: AtomicUsize,
    shutdown: AtomicBool,
    direct: AtomicU64,
    queued: AtomicU64,
    dequeued: AtomicU64,
    dropped_resubmits: AtomicU64,
}

impl PoolInner {
    fn submit(&self, task: BoxedTask, ok_to_queue: bool) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            return false;
        }

        let senders = self.senders.lock();
        let Some(senders) = senders.as_ref() else {
            return false;
        };

        match senders.direct.try_send(task) {
            Ok(()) => {
                self.direct.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(task)) if ok_to_queue => {
                self.queue_len.fetch_add(1, Ordering::AcqRel);
                if senders.backlog.send(task).is_ok() {
                    self.queued.fetch_add(1, Ordering::Relaxed);
                    true
                } else {
                    self.queue_len.fetch_sub(1, Ordering::AcqRel);
                    false
                }
            }
            Err(_) => false,
        }
    }

    fn take_backlog(&self, backlog: &Receiver<BoxedTask>) -> Option<BoxedTask> {
        let task = backlog.try_recv().ok()?;
        self.queue_len.fetch_sub(1, Ordering::AcqRel);
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(task)
    }
}

/// Named pool of background workers
pub struct HotThreadPool {
    inner: Arc<PoolInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl HotThreadPool {
    /// Start `threads` workers (at least one)
    pub fn new(name: &str, threads: usize) -> std::io::Result<Self> {
        let (direct_tx, direct_rx) = channel::bounded::<BoxedTask>(0);
        let (backlog_tx, backlog_rx) = channel::unbounded::<BoxedTask>();

        let inner = Arc::new(PoolInner {
            name: name.to_string(),
            senders: Mutex::new(Some(Senders {
                direct: direct_tx,
                backlog: backlog_tx,
            })),
            queue_len: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            direct: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            dropped_resubmits: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let inner = Arc::clone(&inner);
            let direct_rx = direct_rx.clone();
            let backlog_rx = backlog_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(inner, direct_rx, backlog_rx))
                .map_err(|e| {
                    error!(pool = name, error = %e, "failed to spawn pool worker");
                    e
                })?;
            handles.push(handle);
        }

        debug!(pool = name, threads = handles.len(), "Thread pool started");
        Ok(Self {
            inner,
            handles: Mutex::new(handles),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Hand `task` to an idle worker, or queue it when `ok_to_queue`
    ///
    /// Returns false when the task was not accepted; it is dropped.
    pub fn submit(&self, task: BoxedTask, ok_to_queue: bool) -> bool {
        self.inner.submit(task, ok_to_queue)
    }

    /// Tasks waiting in the backlog
    pub fn queue_len(&self) -> usize {
        self.inner.queue_len.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            direct: self.inner.direct.load(Ordering::Relaxed),
            queued: self.inner.queued.load(Ordering::Relaxed),
            dequeued: self.inner.dequeued.load(Ordering::Relaxed),
            dropped_resubmits: self.inner.dropped_resubmits.load(Ordering::Relaxed),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work and join every worker; queued tasks that have
    /// not started are dropped
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.senders.lock().take();

        let current = std::thread::current().id();
        for handle in self.handles.lock().drain(..) {
            // A worker can end up dropping the last owner of its own pool
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for HotThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<PoolInner>, direct: Receiver<BoxedTask>, backlog: Receiver<BoxedTask>) {
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        let task = match inner.take_backlog(&backlog) {
            Some(task) => Some(task),
            None => select! {
                recv(direct) -> task => task.ok(),
                recv(backlog) -> task => task.ok().map(|t| {
                    inner.queue_len.fetch_sub(1, Ordering::AcqRel);
                    inner.dequeued.fetch_add(1, Ordering::Relaxed);
                    t
                }),
            },
        };

        let Some(mut task) = task else {
            break;
        };

        task.run();
        if task.resubmit() && !inner.submit(task, true) {
            inner.dropped_resubmits.fetch_add(1, Ordering::Relaxed);
            debug!(pool = %inner.name, "resubmitted task refused, pool shutting down");
        }
    }

    debug!(pool = %inner.name, "Pool worker exiting");
}
