//! Cross-thread operation channel.
//!
//! Every mutation of the machine space goes through [`OperationChannel`]. In
//! [`Mode::Normal`] an operation runs immediately on the calling thread under
//! the submission lock. In [`Mode::RealTime`] it is pushed onto a bounded rtrb
//! queue that the audio thread drains after each rendered period, and a
//! synchronous caller blocks on a token until its result comes back.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use parking_lot::{Mutex, ReentrantMutex};
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use tracing::{debug, error, info, warn};

use super::error::{EngineError, EngineResult};

/// Default capacity of the operation queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default number of operations executed per drain.
pub const DEFAULT_DRAIN_LIMIT: usize = 50;

/// Attempts made to push onto a full queue before giving up.
pub const DEFAULT_PUSH_RETRIES: usize = 100;

const PUSH_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// A queued mutation.
pub type Job<T> = Box<dyn FnOnce(&mut T) -> EngineResult<()> + Send>;

/// Called for errors nobody is waiting for. The default logs and aborts.
pub type FatalHandler = Arc<dyn Fn(&EngineError) + Send + Sync>;

/// The default fatal handler.
pub fn abort_on_fatal() -> FatalHandler {
    Arc::new(|err: &EngineError| {
        error!(error = %err, "fatal engine error, aborting");
        std::process::abort();
    })
}

/// Execution mode of the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Operations execute inline on the calling thread.
    Normal,
    /// Operations are deferred to the bound real-time thread.
    RealTime,
}

thread_local! {
    static EXCLUSIVE: Cell<bool> = const { Cell::new(false) };
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Thread tokens start at 1 so that 0 means "no real-time thread".
static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Returns true while the current thread holds the target, either running an
/// operation or rendering.
pub fn in_exclusive_scope() -> bool {
    EXCLUSIVE.with(Cell::get)
}

/// Marks the current thread as holding the target until dropped.
struct ExclusiveScope {
    previous: bool,
}

impl ExclusiveScope {
    fn enter() -> Self {
        Self {
            previous: EXCLUSIVE.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for ExclusiveScope {
    fn drop(&mut self) {
        let previous = self.previous;
        EXCLUSIVE.with(|flag| flag.set(previous));
    }
}

struct Operation<T> {
    job: Job<T>,
    token: Option<Sender<EngineResult<()>>>,
}

/// The operation channel for a target of type `T`.
///
/// The submission lock orders pushes and mode switches. The real-time thread
/// never takes it: it reads the mode and its own binding from atomics.
pub struct OperationChannel<T> {
    submit: ReentrantMutex<RefCell<Producer<Operation<T>>>>,
    consumer: Mutex<Consumer<Operation<T>>>,
    realtime: AtomicBool,
    realtime_thread: AtomicU64,
    drain_limit: usize,
    push_retries: usize,
    fatal: FatalHandler,
}

impl<T> OperationChannel<T> {
    pub fn new(capacity: usize, drain_limit: usize, fatal: FatalHandler) -> Self {
        let (producer, consumer) = RingBuffer::new(capacity.max(1));
        Self {
            submit: ReentrantMutex::new(RefCell::new(producer)),
            consumer: Mutex::new(consumer),
            realtime: AtomicBool::new(false),
            realtime_thread: AtomicU64::new(0),
            drain_limit: drain_limit.max(1),
            push_retries: DEFAULT_PUSH_RETRIES,
            fatal,
        }
    }

    /// Overrides how often a push onto a full queue is retried.
    pub fn with_push_retries(mut self, retries: usize) -> Self {
        self.push_retries = retries;
        self
    }

    pub fn mode(&self) -> Mode {
        if self.realtime.load(Ordering::Acquire) {
            Mode::RealTime
        } else {
            Mode::Normal
        }
    }

    fn bound_to_current_thread(&self) -> bool {
        self.realtime_thread.load(Ordering::Acquire) == current_thread_token()
    }

    /// Returns true if the current thread is the bound real-time thread.
    pub fn is_realtime_thread(&self) -> bool {
        self.mode() == Mode::RealTime && self.bound_to_current_thread()
    }

    /// Number of operations waiting to be drained.
    pub fn pending(&self) -> usize {
        self.consumer.lock().slots()
    }

    /// Submits `job`.
    ///
    /// Runs it inline unless real-time mode is active and the caller is not the
    /// real-time thread. A synchronous caller gets the job's result; a
    /// fire-and-forget caller only learns about inline failures.
    ///
    /// A full queue is retried with the submission lock released, so the
    /// real-time thread keeps draining meanwhile. The mode is checked again on
    /// every attempt.
    pub fn enqueue(&self, target: &Mutex<T>, job: Job<T>, synchronous: bool) -> EngineResult<()> {
        if in_exclusive_scope() {
            return Err(EngineError::sanity(
                "operation submitted while the machine space is held",
            ));
        }

        let (token, receiver) = if synchronous {
            let (tx, rx) = bounded(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let mut op = Operation { job, token };
        let mut attempt = 0;

        loop {
            let guard = self.submit.lock();
            if self.mode() == Mode::Normal || self.bound_to_current_thread() {
                let mut target = target.lock();
                let _scope = ExclusiveScope::enter();
                return (op.job)(&mut target);
            }

            let pushed = guard.borrow_mut().push(op);
            drop(guard);
            match pushed {
                Ok(()) => break,
                Err(PushError::Full(returned)) => {
                    if attempt == self.push_retries {
                        return Err(EngineError::ResourceExhausted("operation queue full".into()));
                    }
                    if attempt == 0 {
                        warn!("operation queue full, retrying");
                    }
                    op = returned;
                    attempt += 1;
                    thread::sleep(PUSH_RETRY_INTERVAL);
                }
            }
        }

        match receiver {
            Some(rx) => rx
                .recv()
                .map_err(|_| EngineError::sanity("operation dropped before completion"))?,
            None => Ok(()),
        }
    }

    /// Runs `f` and returns its value to the caller.
    pub fn run_sync<R, F>(&self, target: &Mutex<T>, f: F) -> EngineResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut T) -> EngineResult<R> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.enqueue(
            target,
            Box::new(move |t| {
                let value = f(t)?;
                let _ = tx.send(value);
                Ok(())
            }),
            true,
        )?;
        rx.try_recv()
            .map_err(|_| EngineError::sanity("synchronous operation produced no value"))
    }

    /// Submits `f` without waiting for it.
    pub fn fire<F>(&self, target: &Mutex<T>, f: F) -> EngineResult<()>
    where
        F: FnOnce(&mut T) -> EngineResult<()> + Send + 'static,
    {
        self.enqueue(target, Box::new(f), false)
    }

    /// Executes up to the drain limit of queued operations.
    ///
    /// Called by the real-time thread with the target already held.
    pub fn drain(&self, target: &mut T) -> usize {
        let Some(mut consumer) = self.consumer.try_lock() else {
            return 0;
        };
        let mut done = 0;
        while done < self.drain_limit {
            let Ok(op) = consumer.pop() else {
                break;
            };
            self.complete(op, target);
            done += 1;
        }
        done
    }

    fn complete(&self, op: Operation<T>, target: &mut T) {
        let _scope = ExclusiveScope::enter();
        let result = (op.job)(target);
        match op.token {
            Some(token) => {
                let _ = token.send(result);
            }
            None => match result {
                Ok(()) => {}
                Err(err) if err.is_validation() => {
                    warn!(error = %err, "deferred operation rejected");
                }
                Err(err) => (self.fatal)(&err),
            },
        }
    }

    /// Binds the current thread as the real-time thread and starts deferring.
    pub fn enter_realtime(&self) -> EngineResult<()> {
        if in_exclusive_scope() {
            return Err(EngineError::sanity("mode switch while the machine space is held"));
        }
        let _guard = self.submit.lock();
        self.realtime_thread
            .store(current_thread_token(), Ordering::Release);
        self.realtime.store(true, Ordering::Release);
        info!("low latency mode enabled");
        Ok(())
    }

    /// Returns to normal mode, executing every queued operation before returning.
    pub fn leave_realtime(&self, target: &Mutex<T>) -> EngineResult<()> {
        if in_exclusive_scope() {
            return Err(EngineError::sanity("mode switch while the machine space is held"));
        }
        let guard = self.submit.lock();
        if !self.realtime.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.realtime_thread.store(0, Ordering::Release);

        let mut target = target.lock();
        let mut consumer = self.consumer.lock();
        let mut flushed = 0;
        while let Ok(op) = consumer.pop() {
            self.complete(op, &mut target);
            flushed += 1;
        }
        drop(guard);
        debug!(flushed, "operation queue flushed");
        info!("low latency mode disabled");
        Ok(())
    }

    /// Runs one period pull.
    ///
    /// On the real-time thread `f` runs first and the queue is drained after it.
    /// In normal mode `f` runs under the target lock. Pulling from any other
    /// thread while real-time mode is active is refused.
    pub fn pull<R>(&self, target: &Mutex<T>, f: impl FnOnce(&mut T) -> R) -> EngineResult<R> {
        if in_exclusive_scope() {
            return Err(EngineError::sanity("Recursive period pull"));
        }

        match self.mode() {
            Mode::Normal => {
                let mut target = target.lock();
                let _scope = ExclusiveScope::enter();
                Ok(f(&mut target))
            }
            Mode::RealTime if self.bound_to_current_thread() => {
                let mut target = target.lock();
                let _scope = ExclusiveScope::enter();
                let result = f(&mut target);
                self.drain(&mut target);
                Ok(result)
            }
            Mode::RealTime => Err(EngineError::sanity(
                "period pulled from a thread other than the real-time thread",
            )),
        }
    }
}
