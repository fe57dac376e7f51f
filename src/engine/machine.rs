//! A node in the machine graph.
//!
//! A [`Machine`] owns its plugin instance, the wiring of its inputs and
//! outputs, its controllers and its dependency counts. Signal buffers live in
//! the [`SignalPool`](super::signal_pool::SignalPool) so that a machine can
//! execute while reading the outputs of others.

use std::collections::BTreeMap;

use crate::dsp::controller::{Controller, ControllerValue};
use crate::dsp::plugin::Plugin;
use crate::dsp::port::{InputDescriptor, OutputDescriptor};
use crate::dsp::signal::{DefaultsTable, Dimension, SignalBuffer};

use super::arena::{MachineId, SignalId};
use super::error::{EngineError, EngineResult};

/// A named input and the signals feeding it, in attach order.
#[derive(Clone, Debug)]
pub struct InputSlot {
    pub descriptor: InputDescriptor,
    pub sources: Vec<SignalId>,
}

/// A named output and the machines consuming it.
#[derive(Clone, Debug)]
pub struct OutputSlot {
    pub descriptor: OutputDescriptor,
    /// Consumers with the number of their inputs attached to this output.
    pub consumers: Vec<(MachineId, usize)>,
}

/// Buffers allocated for a machine before it is registered.
pub struct MachineBuffers {
    pub outputs: Vec<SignalBuffer>,
    pub premix: Vec<(usize, SignalBuffer)>,
}

/// A graph node.
pub struct Machine {
    name: String,
    type_id: &'static str,
    is_sink: bool,
    plugin: Box<dyn Plugin>,
    position: (f32, f32),
    inputs: Vec<InputSlot>,
    outputs: Vec<OutputSlot>,
    controllers: Vec<Controller>,
    dependencies: BTreeMap<MachineId, usize>,
    tight: Vec<MachineId>,
    refs: usize,
    registered: bool,
}

impl Machine {
    /// Wraps a plugin instance. The new machine holds one reference, owned by the machine set.
    pub fn new(name: String, plugin: Box<dyn Plugin>) -> Self {
        let info = plugin.info();
        let type_id = info.id;
        let is_sink = info.is_sink();
        let inputs = plugin
            .inputs()
            .iter()
            .map(|descriptor| InputSlot {
                descriptor: descriptor.clone(),
                sources: Vec::new(),
            })
            .collect();
        let outputs = plugin
            .outputs()
            .iter()
            .map(|descriptor| OutputSlot {
                descriptor: descriptor.clone(),
                consumers: Vec::new(),
            })
            .collect();
        let controllers = plugin
            .controllers()
            .iter()
            .cloned()
            .map(Controller::new)
            .collect();

        Self {
            name,
            type_id,
            is_sink,
            plugin,
            position: (0.0, 0.0),
            inputs,
            outputs,
            controllers,
            dependencies: BTreeMap::new(),
            tight: Vec::new(),
            refs: 1,
            registered: false,
        }
    }

    /// Allocates one buffer per output and one premix buffer per premixed input.
    pub fn allocate_buffers(&self, defaults: &DefaultsTable) -> EngineResult<MachineBuffers> {
        let outputs = self
            .outputs
            .iter()
            .map(|o| allocate(o.descriptor.dimension, o.descriptor.channels, defaults))
            .collect::<EngineResult<Vec<_>>>()?;
        let premix = self
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, i)| i.descriptor.premix)
            .map(|(index, i)| {
                allocate(i.descriptor.dimension, i.descriptor.channels, defaults)
                    .map(|buffer| (index, buffer))
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(MachineBuffers { outputs, premix })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn type_id(&self) -> &'static str {
        self.type_id
    }

    pub fn is_sink(&self) -> bool {
        self.is_sink
    }

    pub fn position(&self) -> (f32, f32) {
        self.position
    }

    pub fn set_position(&mut self, x: f32, y: f32) {
        self.position = (x, y);
    }

    pub fn hint(&self) -> &str {
        self.plugin.hint()
    }

    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.as_ref()
    }

    pub(crate) fn plugin_mut(&mut self) -> &mut dyn Plugin {
        self.plugin.as_mut()
    }

    /// Splits the machine into the parts needed while it executes.
    pub(crate) fn execution_parts(&mut self) -> (&str, &[InputSlot], &mut dyn Plugin) {
        (&self.name, &self.inputs, self.plugin.as_mut())
    }

    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputSlot] {
        &self.outputs
    }

    pub fn input_index(&self, name: &str) -> EngineResult<usize> {
        self.inputs
            .iter()
            .position(|i| i.descriptor.name == name)
            .ok_or_else(|| EngineError::unknown("input", format!("{}:{}", self.name, name)))
    }

    pub fn output_index(&self, name: &str) -> EngineResult<usize> {
        self.outputs
            .iter()
            .position(|o| o.descriptor.name == name)
            .ok_or_else(|| EngineError::unknown("output", format!("{}:{}", self.name, name)))
    }

    pub fn input_names(&self) -> Vec<String> {
        self.inputs
            .iter()
            .map(|i| i.descriptor.name.to_string())
            .collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs
            .iter()
            .map(|o| o.descriptor.name.to_string())
            .collect()
    }

    /// Adds `signal` to the fan-in of an input. A MIDI input takes only one producer.
    pub(crate) fn link_source(&mut self, input: usize, signal: SignalId) -> EngineResult<()> {
        let slot = self
            .inputs
            .get_mut(input)
            .ok_or_else(|| EngineError::sanity("input index out of range"))?;
        if slot.descriptor.dimension == Dimension::Midi && !slot.sources.is_empty() {
            return Err(EngineError::sanity(
                "Cannot attach more than one midi signal to an input.",
            ));
        }
        slot.sources.push(signal);
        Ok(())
    }

    /// Removes `signal` from the fan-in of an input. Returns false if it was not linked.
    pub(crate) fn unlink_source(&mut self, input: usize, signal: SignalId) -> bool {
        match self.inputs.get_mut(input) {
            Some(slot) => match slot.sources.iter().position(|s| *s == signal) {
                Some(pos) => {
                    slot.sources.remove(pos);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub(crate) fn add_consumer(&mut self, output: usize, consumer: MachineId) -> EngineResult<()> {
        let slot = self
            .outputs
            .get_mut(output)
            .ok_or_else(|| EngineError::sanity("output index out of range"))?;
        match slot.consumers.iter_mut().find(|(id, _)| *id == consumer) {
            Some((_, count)) => *count += 1,
            None => slot.consumers.push((consumer, 1)),
        }
        Ok(())
    }

    pub(crate) fn remove_consumer(&mut self, output: usize, consumer: MachineId) -> EngineResult<()> {
        let slot = self
            .outputs
            .get_mut(output)
            .ok_or_else(|| EngineError::sanity("output index out of range"))?;
        let pos = slot
            .consumers
            .iter()
            .position(|(id, _)| *id == consumer)
            .ok_or_else(|| EngineError::sanity("signal not attached to consumer"))?;
        slot.consumers[pos].1 -= 1;
        if slot.consumers[pos].1 == 0 {
            slot.consumers.remove(pos);
        }
        Ok(())
    }

    /// Machines this one consumes from, in id order.
    pub fn dependencies(&self) -> impl Iterator<Item = MachineId> + '_ {
        self.dependencies.keys().copied()
    }

    pub fn dependency_count(&self, on: MachineId) -> usize {
        self.dependencies.get(&on).copied().unwrap_or(0)
    }

    pub(crate) fn add_dependency(&mut self, on: MachineId) {
        *self.dependencies.entry(on).or_insert(0) += 1;
    }

    /// Decrements the dependency count on `on`, dropping the entry at zero.
    pub(crate) fn remove_dependency(&mut self, on: MachineId) -> EngineResult<()> {
        let count = self
            .dependencies
            .get_mut(&on)
            .ok_or_else(|| EngineError::sanity("Dependant not found."))?;
        *count -= 1;
        if *count == 0 {
            self.dependencies.remove(&on);
        }
        Ok(())
    }

    pub fn tightly_connected(&self) -> &[MachineId] {
        &self.tight
    }

    pub(crate) fn add_tight(&mut self, other: MachineId) {
        self.tight.push(other);
    }

    pub(crate) fn remove_tight(&mut self, other: MachineId) {
        self.tight.retain(|id| *id != other);
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    pub(crate) fn reference(&mut self) {
        self.refs += 1;
    }

    /// Drops one reference and returns the remaining count.
    pub(crate) fn dereference(&mut self) -> EngineResult<usize> {
        if self.refs == 0 {
            return Err(EngineError::sanity(format!(
                "unbalanced reference count on [{}]",
                self.name
            )));
        }
        self.refs -= 1;
        Ok(self.refs)
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub(crate) fn set_registered(&mut self, registered: bool) {
        self.registered = registered;
    }

    pub fn controllers(&self) -> &[Controller] {
        &self.controllers
    }

    pub fn controller(&self, name: &str) -> EngineResult<&Controller> {
        self.controllers
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| EngineError::unknown("controller", format!("{}:{}", self.name, name)))
    }

    pub(crate) fn controller_mut(&mut self, name: &str) -> EngineResult<&mut Controller> {
        let machine = &self.name;
        self.controllers
            .iter_mut()
            .find(|c| c.name() == name)
            .ok_or_else(|| EngineError::unknown("controller", format!("{}:{}", machine, name)))
    }

    /// Group names in declaration order, without duplicates.
    pub fn controller_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for c in &self.controllers {
            let group = c.definition().group;
            if !groups.iter().any(|g| g == group) {
                groups.push(group.to_string());
            }
        }
        groups
    }

    /// Controller names, optionally restricted to one group.
    pub fn controller_names(&self, group: Option<&str>) -> Vec<String> {
        self.controllers
            .iter()
            .filter(|c| group.map_or(true, |g| c.definition().group == g))
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn get_controller_value(&mut self, name: &str) -> EngineResult<ControllerValue> {
        self.controller(name)?;
        let slot = self.plugin.controller_slot(name).ok_or_else(|| {
            EngineError::sanity(format!("plugin does not expose controller [{}]", name))
        })?;
        Ok(Controller::read(slot))
    }

    /// Writes a controller value. Out-of-range numbers are ignored.
    pub fn set_controller_value(&mut self, name: &str, value: &ControllerValue) -> EngineResult<()> {
        let controller = self
            .controllers
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| EngineError::unknown("controller", format!("{}:{}", self.name, name)))?;
        let slot = self.plugin.controller_slot(name).ok_or_else(|| {
            EngineError::sanity(format!("plugin does not expose controller [{}]", name))
        })?;
        controller.write(slot, value)
    }

    /// Applies a MIDI control-change to every controller bound to `cc`.
    pub(crate) fn apply_midi_cc(&mut self, cc: u8, value: u8) -> EngineResult<()> {
        for controller in self.controllers.iter_mut() {
            if let Some(v) = controller.midi_value(cc, value) {
                if let Some(slot) = self.plugin.controller_slot(controller.name()) {
                    controller.write(slot, &v)?;
                }
            }
        }
        Ok(())
    }
}

fn allocate(dimension: Dimension, channels: usize, defaults: &DefaultsTable) -> EngineResult<SignalBuffer> {
    let d = defaults[dimension.index()]
        .ok_or_else(|| EngineError::sanity("Unsupported dimension."))?;
    SignalBuffer::allocate(dimension, channels, d)
}
