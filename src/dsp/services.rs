//! The capability object handed to a plugin for one call to `execute`.
//!
//! Services gives access to the machine's input and output buffers, the
//! transport, the math tables, the async worker and the host handle. It never
//! allocates on its own.

use super::context::TransportSnapshot;
use super::math::MathTables;
use super::signal::SignalBuffer;
use crate::engine::async_ops::{AsyncJob, AsyncOps, AsyncTicket};
use crate::engine::handle::HostHandle;

/// Read access to the signals attached to a machine's inputs.
pub trait InputSource {
    /// The buffer feeding `name`: the premix buffer for premixed inputs, the
    /// first attached producer otherwise. `None` when nothing is attached.
    fn input(&self, name: &str) -> Option<&SignalBuffer>;

    /// Number of producers attached to `name`.
    fn input_source_count(&self, name: &str) -> usize;

    /// The `index`th producer attached to `name`, in attach order.
    fn input_source(&self, name: &str, index: usize) -> Option<&SignalBuffer>;
}

/// An input source with nothing attached.
pub struct NoInputs;

impl InputSource for NoInputs {
    fn input(&self, _name: &str) -> Option<&SignalBuffer> {
        None
    }

    fn input_source_count(&self, _name: &str) -> usize {
        0
    }

    fn input_source(&self, _name: &str, _index: usize) -> Option<&SignalBuffer> {
        None
    }
}

/// An output buffer lent to the plugin while it executes.
#[derive(Debug)]
pub struct OutputBuffer {
    pub name: &'static str,
    pub buffer: SignalBuffer,
}

/// Per-call services.
pub struct Services<'a> {
    machine_name: &'a str,
    inputs: &'a dyn InputSource,
    outputs: &'a mut [OutputBuffer],
    transport: &'a TransportSnapshot,
    math: &'a MathTables,
    async_ops: &'a AsyncOps,
    host: &'a HostHandle,
    failure: Option<String>,
}

impl<'a> Services<'a> {
    pub fn new(
        machine_name: &'a str,
        inputs: &'a dyn InputSource,
        outputs: &'a mut [OutputBuffer],
        transport: &'a TransportSnapshot,
        math: &'a MathTables,
        async_ops: &'a AsyncOps,
        host: &'a HostHandle,
    ) -> Self {
        Self {
            machine_name,
            inputs,
            outputs,
            transport,
            math,
            async_ops,
            host,
            failure: None,
        }
    }

    /// Name of the executing machine.
    pub fn machine_name(&self) -> &str {
        self.machine_name
    }

    pub fn input(&self, name: &str) -> Option<&SignalBuffer> {
        self.inputs.input(name)
    }

    pub fn input_source_count(&self, name: &str) -> usize {
        self.inputs.input_source_count(name)
    }

    pub fn input_source(&self, name: &str, index: usize) -> Option<&SignalBuffer> {
        self.inputs.input_source(name, index)
    }

    /// Mutable access to a named output buffer.
    pub fn output(&mut self, name: &str) -> Option<&mut SignalBuffer> {
        self.outputs
            .iter_mut()
            .find(|o| o.name == name)
            .map(|o| &mut o.buffer)
    }

    /// Mutable access to an output buffer by declaration index.
    pub fn output_at(&mut self, index: usize) -> Option<&mut SignalBuffer> {
        self.outputs.get_mut(index).map(|o| &mut o.buffer)
    }

    /// Reads `input` and writes `output` at the same time.
    pub fn io(&mut self, input: &str, output: &str) -> (Option<&SignalBuffer>, Option<&mut SignalBuffer>) {
        let inputs = self.inputs;
        let out = self
            .outputs
            .iter_mut()
            .find(|o| o.name == output)
            .map(|o| &mut o.buffer);
        (inputs.input(input), out)
    }

    pub fn transport(&self) -> &TransportSnapshot {
        self.transport
    }

    pub fn math(&self) -> &MathTables {
        self.math
    }

    /// Runs `job` on the async worker. Poll the returned ticket to learn when it has finished.
    pub fn run_async(&self, job: AsyncJob) -> AsyncTicket {
        self.async_ops.run_function(job)
    }

    pub fn host(&self) -> &HostHandle {
        self.host
    }

    /// Records a non-fatal failure. It is forwarded to the event queue once
    /// `execute` returns.
    pub fn report_failure(&mut self, message: impl Into<String>) {
        self.failure = Some(message.into());
    }

    pub fn take_failure(&mut self) -> Option<String> {
        self.failure.take()
    }
}
