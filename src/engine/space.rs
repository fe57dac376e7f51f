//! The machine space: every machine, signal and scheduler value of one engine.
//!
//! A [`MachineSpace`] is only ever touched from inside the operation channel,
//! either by an operation closure or by the period pull. Nothing in here locks
//! or blocks; work that must happen elsewhere (listener notification, periodic
//! callbacks, dropping released machines) is collected in an outbox and handed
//! to the async worker once the space is released.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::dsp::controller::{signal_value_name, ControllerKind, ControllerValue, MidiBinding};
use crate::dsp::math::MathTables;
use crate::dsp::plugin::SinkOutput;
use crate::dsp::services::{OutputBuffer, Services};
use crate::dsp::signal::{DefaultsTable, Dimension, SignalBuffer, SignalDefaults};

use super::arena::{Arena, MachineId, SignalId};
use super::async_ops::{AsyncJob, AsyncOps};
use super::commands::{EngineEvent, EventSender};
use super::error::{EngineError, EngineResult};
use super::handle::HostHandle;
use super::listeners::{ListenerSet, MachineRef, MachineSetListener};
use super::machine::{Machine, MachineBuffers};
use super::render_chain::{depends_on, RenderChain};
use super::signal_pool::{InputView, SignalPool};
use super::static_signals::{StaticSignal, StaticSignalTable};
use super::timing::{EngineState, PeriodStart, PeriodicCallback};

/// Result of one period pull, consumed by the audio back-end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkStatus {
    /// Play the buffer.
    JustPlay,
    /// Play the buffer and also write it to the record file.
    Record,
    /// Playback is stopped; the buffer is silent.
    Paused,
    /// First pull after playback started; the buffer is silent.
    Resumed,
    /// The caller is not the registered sink; the buffer is silent.
    NotASink,
    /// A machine failed while rendering; the buffer is silent.
    Exception,
}

/// Shared services every machine in the space sees.
pub struct SpaceEnv {
    pub math: Arc<MathTables>,
    pub async_ops: Arc<AsyncOps>,
    pub host: HostHandle,
}

/// The machine graph together with the scheduler state.
pub struct MachineSpace {
    machines: Arena<Machine>,
    pool: SignalPool,
    names: HashMap<String, MachineId>,
    /// Registered machines in registration order.
    order: Vec<MachineId>,
    sink: Option<MachineId>,
    chain: RenderChain,
    state: EngineState,
    defaults: DefaultsTable,
    listeners: ListenerSet,
    static_signals: StaticSignalTable,
    env: SpaceEnv,
    events: EventSender,
    outbox: Vec<AsyncJob>,
    scratch: Vec<OutputBuffer>,
}

impl MachineSpace {
    pub fn new(state: EngineState, defaults: DefaultsTable, env: SpaceEnv, events: EventSender) -> Self {
        let mut state = state;
        state.calculate_samples_per_tick(&defaults);
        Self {
            machines: Arena::new(),
            pool: SignalPool::new(),
            names: HashMap::new(),
            order: Vec::new(),
            sink: None,
            chain: RenderChain::new(),
            state,
            defaults,
            listeners: ListenerSet::new(),
            static_signals: StaticSignalTable::new(),
            env,
            events,
            outbox: Vec::with_capacity(64),
            scratch: Vec::new(),
        }
    }

    pub fn defaults(&self) -> &DefaultsTable {
        &self.defaults
    }

    pub fn math(&self) -> Arc<MathTables> {
        Arc::clone(&self.env.math)
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut EngineState {
        &mut self.state
    }

    pub fn static_signals(&self) -> &StaticSignalTable {
        &self.static_signals
    }

    // ---- machine set ----

    fn machine_id(&self, name: &str) -> EngineResult<MachineId> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::unknown("machine", name))
    }

    fn machine(&self, id: MachineId) -> EngineResult<&Machine> {
        self.machines
            .get(id)
            .ok_or_else(|| EngineError::sanity(format!("stale machine id {}", id)))
    }

    fn machine_mut(&mut self, id: MachineId) -> EngineResult<&mut Machine> {
        self.machines
            .get_mut(id)
            .ok_or_else(|| EngineError::sanity(format!("stale machine id {}", id)))
    }

    /// Looks up a registered machine by name.
    pub fn find(&self, name: &str) -> EngineResult<&Machine> {
        self.machine(self.machine_id(name)?)
    }

    fn find_mut(&mut self, name: &str) -> EngineResult<&mut Machine> {
        let id = self.machine_id(name)?;
        self.machine_mut(id)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn machine_count(&self) -> usize {
        self.order.len()
    }

    /// Names of registered machines in registration order.
    pub fn machine_names(&self) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|id| self.machines.get(*id))
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Picks the name for a new machine.
    ///
    /// An explicit name must be free. Otherwise the name is `m#<n>:<base>` with
    /// `n` starting at the machine count and bumped until unused.
    pub fn reserve_name(&self, base: &str, explicit: Option<&str>) -> EngineResult<String> {
        if let Some(name) = explicit {
            if self.names.contains_key(name) {
                return Err(EngineError::sanity(format!(
                    "machine name [{}] already in use",
                    name
                )));
            }
            return Ok(name.to_string());
        }
        let mut n = self.order.len();
        loop {
            let candidate = format!("m#{}:{}", n, base);
            if !self.names.contains_key(&candidate) {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    /// Adds a constructed machine to the space.
    ///
    /// `allocated_with` are the defaults the buffers were allocated for; they are
    /// reshaped if the defaults changed in the meantime. A sink machine becomes
    /// the registered sink.
    pub fn register_machine(
        &mut self,
        machine: Machine,
        buffers: MachineBuffers,
        allocated_with: &DefaultsTable,
    ) -> EngineResult<MachineId> {
        let mut machine = machine;
        let mut buffers = buffers;
        if self.names.contains_key(machine.name()) {
            return Err(EngineError::sanity(format!(
                "machine name [{}] already in use",
                machine.name()
            )));
        }
        if machine.is_sink() && self.sink.is_some() {
            return Err(EngineError::sanity("Multiple sinks not allowed."));
        }

        if *allocated_with != self.defaults {
            let premix = buffers.premix.iter_mut().map(|(_, b)| b);
            for buffer in buffers.outputs.iter_mut().chain(premix) {
                let defaults = self.defaults[buffer.dimension().index()]
                    .ok_or_else(|| EngineError::sanity("Unsupported dimension."))?;
                buffer.reallocate(defaults)?;
            }
        }

        machine.plugin_mut().prepare(&self.defaults);
        machine.set_registered(true);
        let name = machine.name().to_string();
        let is_sink = machine.is_sink();
        let outputs = machine.outputs().len();

        let id = self.machines.insert(machine);
        self.pool.insert_machine(id, buffers);
        self.names.insert(name.clone(), id);
        self.order.push(id);
        if self.scratch.capacity() < outputs {
            self.scratch.reserve(outputs);
        }
        if is_sink {
            self.sink = Some(id);
            self.rebuild_chain();
        }

        info!(machine = %name, "machine registered");
        self.notify_registration(id, true, None);
        Ok(id)
    }

    pub fn set_name(&mut self, name: &str, new_name: &str) -> EngineResult<()> {
        let id = self.machine_id(name)?;
        if name == new_name {
            return Ok(());
        }
        if self.names.contains_key(new_name) {
            return Err(EngineError::sanity(format!(
                "machine name [{}] already in use",
                new_name
            )));
        }
        self.machine_mut(id)?.set_name(new_name.to_string());
        self.names.remove(name);
        self.names.insert(new_name.to_string(), id);
        debug!(from = name, to = new_name, "machine renamed");
        Ok(())
    }

    pub fn set_position(&mut self, name: &str, x: f32, y: f32) -> EngineResult<()> {
        self.find_mut(name)?.set_position(x, y);
        Ok(())
    }

    pub fn position(&self, name: &str) -> EngineResult<(f32, f32)> {
        Ok(self.find(name)?.position())
    }

    pub fn type_of(&self, name: &str) -> EngineResult<&'static str> {
        Ok(self.find(name)?.type_id())
    }

    /// Groups two machines so that destroying either destroys both.
    pub fn tightly_connect(&mut self, a: &str, b: &str) -> EngineResult<()> {
        let ia = self.machine_id(a)?;
        let ib = self.machine_id(b)?;
        if ia == ib || self.machine(ia)?.tightly_connected().contains(&ib) {
            return Err(EngineError::sanity(format!(
                "[{}] and [{}] are already tightly connected",
                a, b
            )));
        }
        self.machine_mut(ia)?.add_tight(ib);
        self.machine_mut(ib)?.add_tight(ia);
        Ok(())
    }

    pub fn tightly_connected(&self, name: &str) -> EngineResult<Vec<String>> {
        Ok(self
            .find(name)?
            .tightly_connected()
            .iter()
            .filter_map(|id| self.machines.get(*id))
            .map(|m| m.name().to_string())
            .collect())
    }

    /// Detaches every connection of a machine, destroys its tightly connected
    /// machines and deregisters it.
    pub fn disconnect_and_destroy(&mut self, name: &str) -> EngineResult<()> {
        let id = self.machine_id(name)?;
        self.destroy(id)
    }

    /// Destroys every machine. Machines removed along with a tight partner are skipped.
    pub fn destroy_all_machines(&mut self) -> EngineResult<()> {
        for id in self.order.clone() {
            self.destroy(id)?;
        }
        Ok(())
    }

    fn destroy(&mut self, id: MachineId) -> EngineResult<()> {
        if !self.machines.get(id).is_some_and(Machine::is_registered) {
            return Ok(());
        }
        self.disconnect_machine(id)?;

        let machine = self.machine_mut(id)?;
        machine.set_registered(false);
        let name = machine.name().to_string();
        let tight = machine.tightly_connected().to_vec();

        self.names.remove(&name);
        self.order.retain(|m| *m != id);
        if self.sink == Some(id) {
            self.sink = None;
        }
        self.rebuild_chain();
        info!(machine = %name, "machine unregistered");

        self.notify_registration(id, false, None);
        self.dereference(id)?;

        for other in tight {
            if let Some(partner) = self.machines.get_mut(other) {
                partner.remove_tight(id);
            }
            self.destroy(other)?;
        }
        Ok(())
    }

    fn disconnect_machine(&mut self, id: MachineId) -> EngineResult<()> {
        let machine = self.machine(id)?;
        let inputs: Vec<(usize, SignalId)> = machine
            .inputs()
            .iter()
            .enumerate()
            .flat_map(|(index, slot)| slot.sources.iter().map(move |s| (index, *s)))
            .collect();
        let outputs: Vec<(usize, MachineId)> = machine
            .outputs()
            .iter()
            .enumerate()
            .flat_map(|(index, slot)| slot.consumers.iter().map(move |(c, _)| (index, *c)))
            .collect();

        for (input, signal) in inputs {
            self.unlink(signal, id, input)?;
        }
        for (output, consumer) in outputs {
            let signal = SignalId::new(id, output);
            let fed: Vec<usize> = self
                .machine(consumer)?
                .inputs()
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.sources.contains(&signal))
                .map(|(index, _)| index)
                .collect();
            for input in fed {
                self.unlink(signal, consumer, input)?;
            }
        }
        Ok(())
    }

    /// Drops one reference. The machine is released when the count reaches zero.
    pub fn dereference(&mut self, id: MachineId) -> EngineResult<()> {
        let machine = self
            .machines
            .get_mut(id)
            .ok_or_else(|| EngineError::sanity("dereference of a released machine"))?;
        if machine.dereference()? > 0 {
            return Ok(());
        }
        if machine.is_registered() {
            return Err(EngineError::sanity(format!(
                "registered machine [{}] lost its last reference",
                machine.name()
            )));
        }
        self.pool.remove_machine(id);
        if let Some(machine) = self.machines.remove(id) {
            debug!(machine = machine.name(), "machine released");
            self.outbox.push(Box::new(move || drop(machine)));
        }
        Ok(())
    }

    /// Number of machines still allocated, including deregistered ones awaiting release.
    pub fn allocated_count(&self) -> usize {
        self.machines.len()
    }

    // ---- wiring ----

    /// Connects `source.output` to `destination.input`.
    pub fn attach(&mut self, source: &str, output: &str, destination: &str, input: &str) -> EngineResult<()> {
        let src = self.machine_id(source)?;
        let dst = self.machine_id(destination)?;

        let src_machine = self.machine(src)?;
        let out_index = src_machine.output_index(output)?;
        let produced = &src_machine.outputs()[out_index].descriptor;
        let (dimension, channels) = (produced.dimension, produced.channels);

        let dst_machine = self.machine(dst)?;
        let in_index = dst_machine.input_index(input)?;
        let slot = &dst_machine.inputs()[in_index];
        slot.descriptor
            .accepts(dimension, channels)
            .map_err(|reason| EngineError::ShapeMismatch {
                output: format!("{}:{}", source, output),
                input: format!("{}:{}", destination, input),
                reason,
            })?;

        let signal = SignalId::new(src, out_index);
        if slot.sources.contains(&signal) {
            return Err(EngineError::sanity(format!(
                "[{}:{}] is already attached to [{}:{}]",
                source, output, destination, input
            )));
        }

        let machines = &self.machines;
        if depends_on(src, dst, |id| dependencies_of(machines, id)) {
            return Err(EngineError::CycleDetected {
                source_machine: source.to_string(),
                destination: destination.to_string(),
            });
        }

        self.machine_mut(dst)?.link_source(in_index, signal)?;
        self.machine_mut(dst)?.add_dependency(src);
        self.machine_mut(src)?.add_consumer(out_index, dst)?;
        self.rebuild_chain();

        info!(source, output, destination, input, "signal attached");
        self.notify_wiring(src, dst, output, input, true);
        Ok(())
    }

    /// Removes the connection from `source.output` to `destination.input`.
    pub fn detach(&mut self, source: &str, output: &str, destination: &str, input: &str) -> EngineResult<()> {
        let src = self.machine_id(source)?;
        let dst = self.machine_id(destination)?;
        let out_index = self.machine(src)?.output_index(output)?;
        let in_index = self.machine(dst)?.input_index(input)?;

        if !self.unlink(SignalId::new(src, out_index), dst, in_index)? {
            return Err(EngineError::NotConnected {
                machine: destination.to_string(),
                input: input.to_string(),
                source_machine: format!("{}:{}", source, output),
            });
        }
        info!(source, output, destination, input, "signal detached");
        Ok(())
    }

    /// Removes one link. Returns false if it did not exist.
    fn unlink(&mut self, signal: SignalId, dst: MachineId, input: usize) -> EngineResult<bool> {
        if !self.machine_mut(dst)?.unlink_source(input, signal) {
            return Ok(false);
        }
        self.machine_mut(dst)?.remove_dependency(signal.machine)?;
        self.machine_mut(signal.machine)?
            .remove_consumer(signal.output, dst)?;
        self.rebuild_chain();

        let output = self.machine(signal.machine)?.outputs()[signal.output]
            .descriptor
            .name;
        let input = self.machine(dst)?.inputs()[input].descriptor.name;
        self.notify_wiring(signal.machine, dst, output, input, false);
        Ok(true)
    }

    pub fn input_names(&self, name: &str) -> EngineResult<Vec<String>> {
        Ok(self.find(name)?.input_names())
    }

    pub fn output_names(&self, name: &str) -> EngineResult<Vec<String>> {
        Ok(self.find(name)?.output_names())
    }

    /// For each input of a machine, the (machine, output) pairs feeding it.
    pub fn input_connections(&self, name: &str) -> EngineResult<Vec<(String, Vec<(String, String)>)>> {
        let machine = self.find(name)?;
        let mut connections = Vec::with_capacity(machine.inputs().len());
        for slot in machine.inputs() {
            let mut sources = Vec::with_capacity(slot.sources.len());
            for signal in &slot.sources {
                let producer = self.machine(signal.machine)?;
                sources.push((
                    producer.name().to_string(),
                    producer.outputs()[signal.output].descriptor.name.to_string(),
                ));
            }
            connections.push((slot.descriptor.name.to_string(), sources));
        }
        Ok(connections)
    }

    /// Number of connections from `source` into `destination`.
    pub fn dependency_count(&self, destination: &str, source: &str) -> EngineResult<usize> {
        let src = self.machine_id(source)?;
        Ok(self.find(destination)?.dependency_count(src))
    }

    // ---- sink and render chain ----

    /// Makes a sink machine the root of the render chain.
    pub fn register_sink(&mut self, name: &str) -> EngineResult<()> {
        let id = self.machine_id(name)?;
        if self.sink.is_some() {
            return Err(EngineError::sanity("Multiple sinks not allowed."));
        }
        if !self.machine(id)?.is_sink() {
            return Err(EngineError::sanity(format!("[{}] is not a sink", name)));
        }
        self.sink = Some(id);
        self.rebuild_chain();
        info!(sink = name, "sink registered");
        Ok(())
    }

    pub fn unregister_sink(&mut self, name: &str) -> EngineResult<()> {
        let id = self.machine_id(name)?;
        if self.sink != Some(id) {
            return Err(EngineError::sanity("Sink not registered."));
        }
        self.sink = None;
        self.rebuild_chain();
        info!(sink = name, "sink unregistered");
        Ok(())
    }

    pub fn sink_name(&self) -> Option<String> {
        self.sink
            .and_then(|id| self.machines.get(id))
            .map(|m| m.name().to_string())
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Machine names in execution order.
    pub fn render_chain_names(&self) -> Vec<String> {
        self.chain
            .iter()
            .filter_map(|id| self.machines.get(id))
            .map(|m| m.name().to_string())
            .collect()
    }

    fn rebuild_chain(&mut self) {
        let machines = &self.machines;
        self.chain
            .rebuild(self.sink, |id| dependencies_of(machines, id));
        debug!(length = self.chain.len(), "render chain rebuilt");
    }

    /// Renders one period into `output` (interleaved, `channels` wide).
    pub fn fill_sink(&mut self, sink: &str, output: &mut [f32], channels: usize) -> SinkStatus {
        let is_sink = match (self.sink, self.names.get(sink)) {
            (Some(registered), Some(id)) => registered == *id,
            _ => false,
        };
        if !is_sink {
            output.fill(0.0);
            return SinkStatus::NotASink;
        }

        match self.state.begin_period() {
            PeriodStart::Paused => {
                output.fill(0.0);
                return SinkStatus::Paused;
            }
            PeriodStart::Resumed => {
                output.fill(0.0);
                return SinkStatus::Resumed;
            }
            PeriodStart::Render => {}
        }

        self.state.calculate_samples_per_tick(&self.defaults);
        if let Err(err) = self.execute_chain() {
            output.fill(0.0);
            warn!(error = %err, "period aborted");
            let (machine, message) = match err {
                EngineError::Plugin { machine, message } => (machine, message),
                other => (String::new(), other.to_string()),
            };
            self.events
                .send(EngineEvent::ExecuteFailed { machine, message });
            return SinkStatus::Exception;
        }

        let outbox = &mut self.outbox;
        self.state.advance(&self.defaults, |callback, line| {
            let callback = Arc::clone(callback);
            outbox.push(Box::new(move || callback(line)));
        });

        let sink_output = self
            .sink
            .and_then(|id| self.machines.get(id))
            .and_then(|m| m.plugin().sink_output());
        copy_sink_output(sink_output, output, channels);

        if self.state.is_recording() {
            SinkStatus::Record
        } else {
            SinkStatus::JustPlay
        }
    }

    fn execute_chain(&mut self) -> EngineResult<()> {
        let transport = self.state.snapshot();
        let Self {
            machines,
            pool,
            chain,
            env,
            events,
            scratch,
            ..
        } = self;

        for id in chain.iter() {
            let Some(machine) = machines.get_mut(id) else {
                continue;
            };
            for (index, slot) in machine.inputs().iter().enumerate() {
                if slot.descriptor.premix {
                    pool.mix_input(id, index, &slot.sources);
                }
            }

            scratch.clear();
            for (index, slot) in machine.outputs().iter().enumerate() {
                let buffer = pool
                    .take(SignalId::new(id, index))
                    .unwrap_or_else(SignalBuffer::detached);
                scratch.push(OutputBuffer {
                    name: slot.descriptor.name,
                    buffer,
                });
            }

            let (name, inputs, plugin) = machine.execution_parts();
            let view = InputView::new(pool, id, inputs);
            let mut services = Services::new(
                name,
                &view,
                scratch.as_mut_slice(),
                &transport,
                &env.math,
                &env.async_ops,
                &env.host,
            );
            let result = plugin.execute(&mut services);
            let failure = services.take_failure();
            drop(services);

            for (index, out) in scratch.drain(..).enumerate() {
                pool.restore(SignalId::new(id, index), out.buffer);
            }
            if let Some(message) = failure {
                events.send(EngineEvent::PluginFailure {
                    machine: name.to_string(),
                    message,
                });
            }
            result.map_err(|err| EngineError::Plugin {
                machine: name.to_string(),
                message: err.to_string(),
            })?;
        }
        Ok(())
    }

    // ---- controllers ----

    pub fn controller_groups(&self, machine: &str) -> EngineResult<Vec<String>> {
        Ok(self.find(machine)?.controller_groups())
    }

    pub fn controller_names(&self, machine: &str, group: Option<&str>) -> EngineResult<Vec<String>> {
        Ok(self.find(machine)?.controller_names(group))
    }

    pub fn get_controller(&mut self, machine: &str, controller: &str) -> EngineResult<ControllerValue> {
        self.find_mut(machine)?.get_controller_value(controller)
    }

    pub fn set_controller(&mut self, machine: &str, controller: &str, value: &ControllerValue) -> EngineResult<()> {
        self.find_mut(machine)?
            .set_controller_value(controller, value)
    }

    /// Display name of an integer controller value.
    pub fn controller_value_name(&self, machine: &str, controller: &str, value: i32) -> EngineResult<String> {
        let c = self.find(machine)?.controller(controller)?;
        match c.kind() {
            ControllerKind::Enum => c.enum_value_name(value).map(str::to_string),
            ControllerKind::SignalId => Ok(signal_value_name(
                value,
                self.static_signals.get(value).map(|s| s.name.as_str()),
            )),
            _ => Ok(value.to_string()),
        }
    }

    pub fn set_midi_controller(
        &mut self,
        machine: &str,
        controller: &str,
        coarse: i32,
        fine: Option<i32>,
    ) -> EngineResult<()> {
        self.find_mut(machine)?
            .controller_mut(controller)?
            .set_midi_controller(coarse, fine)
    }

    pub fn midi_binding(&self, machine: &str, controller: &str) -> EngineResult<Option<MidiBinding>> {
        Ok(self.find(machine)?.controller(controller)?.midi_binding())
    }

    /// Routes a MIDI control change to every bound controller.
    pub fn apply_midi_cc(&mut self, cc: u8, value: u8) -> EngineResult<()> {
        for id in &self.order {
            if let Some(machine) = self.machines.get_mut(*id) {
                machine.apply_midi_cc(cc, value)?;
            }
        }
        Ok(())
    }

    // ---- timing ----

    /// Changes the signal shape of one dimension, reshaping every live buffer.
    pub fn set_signal_defaults(&mut self, dimension: Dimension, defaults: SignalDefaults) -> EngineResult<()> {
        defaults.validate(dimension)?;
        self.pool.reallocate(dimension, defaults)?;
        self.defaults[dimension.index()] = Some(defaults);
        self.state.calculate_samples_per_tick(&self.defaults);
        for (_, machine) in self.machines.iter_mut() {
            machine.plugin_mut().prepare(&self.defaults);
        }
        info!(
            dimension = dimension.name(),
            samples = defaults.samples,
            frequency = defaults.frequency,
            "signal defaults changed"
        );
        Ok(())
    }

    fn reset_machines(&mut self) {
        for (_, machine) in self.machines.iter_mut() {
            machine.plugin_mut().reset();
        }
    }

    /// Resets every machine, then moves the sequencer.
    pub fn jump_to(&mut self, line: i32) {
        self.reset_machines();
        self.state.jump_to(line);
    }

    pub fn rewind(&mut self) {
        self.reset_machines();
        self.state.rewind();
    }

    pub fn register_periodic(&mut self, callback: PeriodicCallback, interval: i32) -> EngineResult<()> {
        self.state.register_periodic(callback, interval)
    }

    pub fn unregister_periodic(&mut self, callback: &PeriodicCallback) {
        self.state.unregister_periodic(callback);
    }

    /// Sets the loading flag; listeners hear `project_loaded` when it is cleared.
    pub fn set_loading(&mut self, loading: bool) {
        if self.state.set_loading(loading) {
            let listeners = self.listeners.live();
            if !listeners.is_empty() {
                self.outbox.push(Box::new(move || {
                    for listener in &listeners {
                        listener.project_loaded();
                    }
                }));
            }
        }
    }

    // ---- static signals ----

    pub fn set_static_signal(&mut self, index: i32, signal: StaticSignal) -> EngineResult<()> {
        if let Some(old) = self.static_signals.set(index, signal)? {
            self.outbox.push(Box::new(move || drop(old)));
        }
        Ok(())
    }

    pub fn clear_static_signal(&mut self, index: i32) -> EngineResult<()> {
        if let Some(old) = self.static_signals.clear(index)? {
            self.outbox.push(Box::new(move || drop(old)));
        }
        Ok(())
    }

    // ---- listeners ----

    /// Adds a listener and tells it about every registered machine.
    pub fn add_listener(&mut self, listener: Arc<dyn MachineSetListener>) {
        if !self.listeners.add(&listener) {
            return;
        }
        for id in self.order.clone() {
            self.notify_registration(id, true, Some(Arc::clone(&listener)));
        }
    }

    pub fn remove_listener(&mut self, listener: &Arc<dyn MachineSetListener>) {
        self.listeners.remove(listener);
    }

    fn machine_ref(&self, id: MachineId) -> Option<MachineRef> {
        self.machines.get(id).map(|m| MachineRef {
            id,
            name: m.name().to_string(),
            type_id: m.type_id(),
        })
    }

    /// Queues a registration notice per listener. Each notice holds a reference
    /// on the machine until it has been delivered.
    fn notify_registration(
        &mut self,
        id: MachineId,
        registered: bool,
        only: Option<Arc<dyn MachineSetListener>>,
    ) {
        let listeners = match only {
            Some(listener) => vec![listener],
            None => self.listeners.live(),
        };
        let Some(who) = self.machine_ref(id) else {
            return;
        };
        for listener in listeners {
            if let Some(machine) = self.machines.get_mut(id) {
                machine.reference();
            }
            let host = self.env.host.clone();
            let who = who.clone();
            self.outbox.push(Box::new(move || {
                if registered {
                    listener.machine_registered(&who);
                } else {
                    listener.machine_unregistered(&who);
                }
                if let Err(err) = host.dereference(who.id) {
                    warn!(machine = %who.name, error = %err, "failed to release machine reference");
                }
            }));
        }
    }

    fn notify_wiring(&mut self, src: MachineId, dst: MachineId, output: &str, input: &str, attached: bool) {
        let listeners = self.listeners.live();
        if listeners.is_empty() {
            return;
        }
        let (Some(source), Some(destination)) = (self.machine_ref(src), self.machine_ref(dst)) else {
            return;
        };
        let output = output.to_string();
        let input = input.to_string();
        self.outbox.push(Box::new(move || {
            for listener in &listeners {
                if attached {
                    listener.machine_input_attached(&source, &destination, &output, &input);
                } else {
                    listener.machine_input_detached(&source, &destination, &output, &input);
                }
            }
        }));
    }

    // ---- outbox ----

    /// Removes all queued async work.
    pub fn take_outbox(&mut self) -> Vec<AsyncJob> {
        mem::take(&mut self.outbox)
    }

    /// Hands queued work to the async worker without waiting for pool items.
    /// Whatever does not fit stays queued, in order, for the next call.
    pub fn dispatch_outbox(&mut self) -> usize {
        let ops = Arc::clone(&self.env.async_ops);
        let mut sent = 0;
        while !self.outbox.is_empty() && ops.available() > 0 {
            let job = self.outbox.remove(0);
            if let Err(job) = ops.try_run_function(job) {
                self.outbox.insert(0, job);
                break;
            }
            sent += 1;
        }
        sent
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }
}

fn dependencies_of(machines: &Arena<Machine>, id: MachineId) -> Vec<MachineId> {
    machines
        .get(id)
        .map(|m| m.dependencies().collect())
        .unwrap_or_default()
}

/// Copies a sink's interleaved output into the driver buffer, converting
/// channel counts. A mono source fills every channel; missing channels are silent.
fn copy_sink_output(source: Option<SinkOutput<'_>>, output: &mut [f32], channels: usize) {
    output.fill(0.0);
    let Some(source) = source else {
        return;
    };
    if channels == 0 || source.channels == 0 {
        return;
    }
    let frames = (output.len() / channels).min(source.samples.len() / source.channels);
    for frame in 0..frames {
        let src = &source.samples[frame * source.channels..(frame + 1) * source.channels];
        let dst = &mut output[frame * channels..(frame + 1) * channels];
        for (c, sample) in dst.iter_mut().enumerate() {
            *sample = if c < source.channels {
                src[c]
            } else if source.channels == 1 {
                src[0]
            } else {
                0.0
            };
        }
    }
}
