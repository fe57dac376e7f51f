//! Shared engine state and the handle plugins and back-ends use to reach it.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::arena::MachineId;
use super::async_ops::AsyncOps;
use super::error::{EngineError, EngineResult};
use super::operations::{in_exclusive_scope, Mode, OperationChannel};
use super::space::{MachineSpace, SinkStatus};

/// The operation channel and the space it guards.
pub(crate) struct Shared {
    pub(crate) channel: OperationChannel<MachineSpace>,
    pub(crate) space: Mutex<MachineSpace>,
    pub(crate) async_ops: Arc<AsyncOps>,
}

impl Shared {
    /// Runs `f` synchronously and returns its value.
    pub(crate) fn run<R, F>(&self, f: F) -> EngineResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut MachineSpace) -> EngineResult<R> + Send + 'static,
    {
        let result = self.channel.run_sync(&self.space, f);
        self.flush_outbox();
        result
    }

    /// Submits `f` without waiting for it.
    pub(crate) fn fire<F>(&self, f: F) -> EngineResult<()>
    where
        F: FnOnce(&mut MachineSpace) -> EngineResult<()> + Send + 'static,
    {
        let result = self.channel.fire(&self.space, f);
        self.flush_outbox();
        result
    }

    /// Hands work queued by operations to the async worker without waiting
    /// for free pool items. Leftovers go out with a later flush.
    ///
    /// In real-time mode the audio thread does this at the start of every period.
    pub(crate) fn flush_outbox(&self) {
        if in_exclusive_scope() || self.channel.mode() == Mode::RealTime {
            return;
        }
        self.space.lock().dispatch_outbox();
    }

    /// Hands every queued job to the async worker, waiting for pool items.
    /// Only for callers that are allowed to block.
    pub(crate) fn settle_outbox(&self) {
        if in_exclusive_scope() || self.channel.mode() == Mode::RealTime {
            return;
        }
        loop {
            let jobs = self.space.lock().take_outbox();
            if jobs.is_empty() {
                break;
            }
            for job in jobs {
                self.async_ops.run_function(job);
            }
        }
    }

    pub(crate) fn fill_sink(&self, sink: &str, output: &mut [f32], channels: usize) -> EngineResult<SinkStatus> {
        let status = self.channel.pull(&self.space, |space| {
            space.dispatch_outbox();
            space.fill_sink(sink, output, channels)
        })?;
        self.flush_outbox();
        Ok(status)
    }

    pub(crate) fn enter_realtime(&self) -> EngineResult<()> {
        if self.channel.mode() == Mode::RealTime {
            return Ok(());
        }
        if !self.run(|space| Ok(space.has_sink()))? {
            return Err(EngineError::sanity(
                "low latency mode needs a registered sink",
            ));
        }
        self.channel.enter_realtime()
    }

    pub(crate) fn leave_realtime(&self) -> EngineResult<()> {
        self.channel.leave_realtime(&self.space)?;
        self.flush_outbox();
        Ok(())
    }
}

/// A weak handle back into the engine.
///
/// Plugins receive one at creation and back-ends use one to pull periods. All
/// calls fail with a sanity violation once the engine is gone, except
/// [`HostHandle::dereference`] which then does nothing.
#[derive(Clone, Default)]
pub struct HostHandle {
    shared: Weak<Shared>,
}

impl HostHandle {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }

    /// A handle that is not connected to any engine.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn is_attached(&self) -> bool {
        self.shared.strong_count() > 0
    }

    fn shared(&self) -> EngineResult<Arc<Shared>> {
        self.shared
            .upgrade()
            .ok_or_else(|| EngineError::sanity("engine has shut down"))
    }

    /// Renders one period for `sink` into `output`.
    ///
    /// In real-time mode only the real-time thread may call this. Calling it
    /// from inside a render is refused.
    pub fn fill_sink(&self, sink: &str, output: &mut [f32], channels: usize) -> EngineResult<SinkStatus> {
        self.shared()?.fill_sink(sink, output, channels)
    }

    /// Releases one reference on a machine, fire-and-forget.
    pub fn dereference(&self, machine: MachineId) -> EngineResult<()> {
        match self.shared.upgrade() {
            Some(shared) => shared.fire(move |space| space.dereference(machine)),
            None => Ok(()),
        }
    }

    /// Routes a MIDI control change to bound controllers, fire-and-forget.
    pub fn apply_midi_cc(&self, cc: u8, value: u8) -> EngineResult<()> {
        self.shared()?
            .fire(move |space| space.apply_midi_cc(cc, value))
    }

    /// Binds the calling thread as the real-time thread.
    pub fn enter_realtime(&self) -> EngineResult<()> {
        self.shared()?.enter_realtime()
    }

    /// Leaves real-time mode, executing everything still queued.
    pub fn leave_realtime(&self) -> EngineResult<()> {
        self.shared()?.leave_realtime()
    }

    /// Returns true if the calling thread is the bound real-time thread.
    pub fn is_realtime_thread(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.channel.is_realtime_thread())
    }
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHandle")
            .field("attached", &self.is_attached())
            .finish()
    }
}
