//! Async offload worker.
//!
//! Moves blocking work (disk writes, listener notifications, deferred drops)
//! off both the caller and the audio thread. A fixed pool of work items is
//! allocated up front; a single named worker thread runs submitted items in
//! submission order and hands each item back to the pool when done.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::error::{EngineError, EngineResult};

/// Work run by the async worker.
pub type AsyncJob = Box<dyn FnOnce() + Send>;

/// Pause between attempts while waiting for a free work item.
const POOL_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// A reusable work item from the pre-allocated pool.
pub struct AsyncOp {
    job: Mutex<Option<AsyncJob>>,
    issued: AtomicU64,
    completed: AtomicU64,
}

impl AsyncOp {
    fn new() -> Self {
        Self {
            job: Mutex::new(None),
            issued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }
}

/// Handle to one submission. Poll [`AsyncTicket::is_finished`] to learn when it ran.
#[derive(Clone)]
pub struct AsyncTicket {
    op: Arc<AsyncOp>,
    serial: u64,
}

impl AsyncTicket {
    pub fn is_finished(&self) -> bool {
        self.op.completed.load(Ordering::Acquire) >= self.serial
    }
}

/// The async offload facility.
pub struct AsyncOps {
    free: Arc<ArrayQueue<Arc<AsyncOp>>>,
    capacity: usize,
    sender: Mutex<Option<Sender<Arc<AsyncOp>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl AsyncOps {
    /// Allocates `pool_size` work items and starts the worker thread.
    pub fn new(pool_size: usize) -> EngineResult<Self> {
        let capacity = pool_size.max(1);
        let free = Arc::new(ArrayQueue::new(capacity));
        for _ in 0..capacity {
            // The queue was sized for exactly this many items.
            let _ = free.push(Arc::new(AsyncOp::new()));
        }

        let (sender, receiver) = bounded::<Arc<AsyncOp>>(capacity);
        let worker_free = Arc::clone(&free);
        let worker = thread::Builder::new()
            .name("async-ops".into())
            .spawn(move || run_worker(receiver, worker_free))
            .map_err(|e| EngineError::SyscallFailure(format!("failed to start async worker: {}", e)))?;
        let worker_id = worker.thread().id();

        Ok(Self {
            free,
            capacity,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    /// Number of work items in the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of submitted items that have not finished yet.
    pub fn pending(&self) -> usize {
        self.capacity - self.free.len()
    }

    /// Number of free work items. A submission this many times in a row does not wait.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Submits `job` to the worker.
    ///
    /// When the pool is exhausted this sleeps and retries until an item is
    /// returned. Calls made from the worker itself, or after shutdown, run inline.
    pub fn run_function(&self, job: AsyncJob) -> AsyncTicket {
        if thread::current().id() == self.worker_id {
            return self.run_inline(job);
        }

        let mut stalled = false;
        let op = loop {
            if let Some(op) = self.free.pop() {
                break op;
            }
            if !stalled {
                warn!(capacity = self.capacity, "async operation pool exhausted, waiting");
                stalled = true;
            }
            thread::sleep(POOL_RETRY_INTERVAL);
        };

        self.dispatch(op, job)
    }

    /// Submits `job` only if a work item is free right now; otherwise hands
    /// the job back.
    pub fn try_run_function(&self, job: AsyncJob) -> Result<AsyncTicket, AsyncJob> {
        if thread::current().id() == self.worker_id {
            return Ok(self.run_inline(job));
        }
        match self.free.pop() {
            Some(op) => Ok(self.dispatch(op, job)),
            None => Err(job),
        }
    }

    fn dispatch(&self, op: Arc<AsyncOp>, job: AsyncJob) -> AsyncTicket {
        let serial = op.issued.fetch_add(1, Ordering::AcqRel) + 1;
        *op.job.lock() = Some(job);
        let ticket = AsyncTicket {
            op: Arc::clone(&op),
            serial,
        };

        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => {
                if let Err(err) = tx.send(op) {
                    drop(sender);
                    finish(err.into_inner(), &self.free);
                }
            }
            None => {
                drop(sender);
                finish(op, &self.free);
            }
        }
        ticket
    }

    fn run_inline(&self, job: AsyncJob) -> AsyncTicket {
        let op = Arc::new(AsyncOp::new());
        op.issued.store(1, Ordering::Release);
        run_job(job);
        op.completed.store(1, Ordering::Release);
        AsyncTicket { op, serial: 1 }
    }

    /// Blocks until every submitted item has finished.
    pub fn wait_for_pending(&self) {
        if thread::current().id() == self.worker_id {
            return;
        }
        while self.free.len() < self.capacity {
            thread::sleep(POOL_RETRY_INTERVAL);
        }
    }

    /// Stops accepting work, lets the worker finish what is queued and joins it.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("async worker terminated abnormally");
            }
        }
    }
}

impl Drop for AsyncOps {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(receiver: Receiver<Arc<AsyncOp>>, free: Arc<ArrayQueue<Arc<AsyncOp>>>) {
    debug!("async worker started");
    for op in receiver.iter() {
        finish(op, &free);
    }
    debug!("async worker stopped");
}

/// Runs the job stored in `op`, marks it finished and returns it to the pool.
fn finish(op: Arc<AsyncOp>, free: &ArrayQueue<Arc<AsyncOp>>) {
    let job = op.job.lock().take();
    if let Some(job) = job {
        run_job(job);
    }
    op.completed
        .store(op.issued.load(Ordering::Acquire), Ordering::Release);
    if free.push(op).is_err() {
        error!("async operation returned to a full pool");
    }
}

fn run_job(job: AsyncJob) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("async operation panicked");
    }
}
