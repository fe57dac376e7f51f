//! Storage for every signal buffer in the graph.
//!
//! Each output of each machine owns one buffer, and each premixed input owns
//! one more that its producers are summed into before the machine executes.
//! Buffers are allocated when a machine is registered and reshaped in place
//! when the per-dimension defaults change, so the audio thread never allocates.

use std::collections::HashMap;
use std::mem;

use crate::dsp::services::InputSource;
use crate::dsp::signal::{Dimension, SignalBuffer, SignalDefaults};

use super::arena::{MachineId, SignalId};
use super::error::EngineResult;
use super::machine::{InputSlot, MachineBuffers};

/// All signal and premix buffers, keyed by owner.
#[derive(Default)]
pub struct SignalPool {
    signals: HashMap<SignalId, SignalBuffer>,
    premix: HashMap<(MachineId, usize), SignalBuffer>,
}

impl SignalPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of the buffers allocated for a machine.
    pub fn insert_machine(&mut self, machine: MachineId, buffers: MachineBuffers) {
        for (output, buffer) in buffers.outputs.into_iter().enumerate() {
            self.signals.insert(SignalId::new(machine, output), buffer);
        }
        for (input, buffer) in buffers.premix {
            self.premix.insert((machine, input), buffer);
        }
    }

    /// Removes all buffers associated with a machine.
    pub fn remove_machine(&mut self, machine: MachineId) {
        self.signals.retain(|id, _| id.machine != machine);
        self.premix.retain(|(owner, _), _| *owner != machine);
    }

    pub fn get(&self, signal: SignalId) -> Option<&SignalBuffer> {
        self.signals.get(&signal)
    }

    pub fn get_mut(&mut self, signal: SignalId) -> Option<&mut SignalBuffer> {
        self.signals.get_mut(&signal)
    }

    /// Moves a buffer out, leaving an empty placeholder. Pair with [`SignalPool::restore`].
    pub fn take(&mut self, signal: SignalId) -> Option<SignalBuffer> {
        self.signals
            .get_mut(&signal)
            .map(|slot| mem::replace(slot, SignalBuffer::detached()))
    }

    /// Puts back a buffer moved out with [`SignalPool::take`].
    pub fn restore(&mut self, signal: SignalId, buffer: SignalBuffer) {
        if let Some(slot) = self.signals.get_mut(&signal) {
            *slot = buffer;
        }
    }

    pub fn premix(&self, machine: MachineId, input: usize) -> Option<&SignalBuffer> {
        self.premix.get(&(machine, input))
    }

    /// Clears the premix buffer of an input and sums every source into it.
    pub fn mix_input(&mut self, machine: MachineId, input: usize, sources: &[SignalId]) {
        let Some(target) = self.premix.get_mut(&(machine, input)) else {
            return;
        };
        target.clear();
        for source in sources {
            if let Some(buffer) = self.signals.get(source) {
                target.mix_from(buffer);
            }
        }
    }

    /// Reshapes and clears every buffer of one dimension.
    pub fn reallocate(&mut self, dimension: Dimension, defaults: SignalDefaults) -> EngineResult<()> {
        for buffer in self
            .signals
            .values_mut()
            .chain(self.premix.values_mut())
            .filter(|b| b.dimension() == dimension)
        {
            buffer.reallocate(defaults)?;
        }
        Ok(())
    }

    /// Clears all buffers (sets all samples to zero).
    pub fn clear_all(&mut self) {
        for buffer in self.signals.values_mut().chain(self.premix.values_mut()) {
            buffer.clear();
        }
    }

    /// Number of output signals.
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

/// The inputs of one machine, as seen by its plugin during `execute`.
pub struct InputView<'a> {
    pool: &'a SignalPool,
    machine: MachineId,
    inputs: &'a [InputSlot],
}

impl<'a> InputView<'a> {
    pub fn new(pool: &'a SignalPool, machine: MachineId, inputs: &'a [InputSlot]) -> Self {
        Self {
            pool,
            machine,
            inputs,
        }
    }

    fn slot(&self, name: &str) -> Option<(usize, &'a InputSlot)> {
        self.inputs
            .iter()
            .enumerate()
            .find(|(_, slot)| slot.descriptor.name == name)
    }
}

impl InputSource for InputView<'_> {
    fn input(&self, name: &str) -> Option<&SignalBuffer> {
        let (index, slot) = self.slot(name)?;
        let first = *slot.sources.first()?;
        if slot.descriptor.premix {
            self.pool.premix(self.machine, index)
        } else {
            self.pool.get(first)
        }
    }

    fn input_source_count(&self, name: &str) -> usize {
        self.slot(name).map_or(0, |(_, slot)| slot.sources.len())
    }

    fn input_source(&self, name: &str, index: usize) -> Option<&SignalBuffer> {
        let (_, slot) = self.slot(name)?;
        self.pool.get(*slot.sources.get(index)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::port::InputDescriptor;
    use crate::dsp::signal::Resolution;
    use crate::engine::arena::Arena;

    fn audio(samples: usize) -> SignalDefaults {
        SignalDefaults::new(samples, Resolution::Float32, 44100)
    }

    fn buffers(outputs: &[usize], premix: &[(usize, usize)]) -> MachineBuffers {
        MachineBuffers {
            outputs: outputs
                .iter()
                .map(|&ch| SignalBuffer::allocate(Dimension::Audio, ch, audio(4)).unwrap())
                .collect(),
            premix: premix
                .iter()
                .map(|&(input, ch)| {
                    (
                        input,
                        SignalBuffer::allocate(Dimension::Audio, ch, audio(4)).unwrap(),
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_insert_and_remove_machine() {
        let mut arena = Arena::new();
        let a = arena.insert(());
        let b = arena.insert(());
        let mut pool = SignalPool::new();
        pool.insert_machine(a, buffers(&[1, 2], &[]));
        pool.insert_machine(b, buffers(&[2], &[(0, 2)]));
        assert_eq!(pool.len(), 3);
        assert!(pool.premix(b, 0).is_some());

        pool.remove_machine(b);
        assert_eq!(pool.len(), 2);
        assert!(pool.premix(b, 0).is_none());
        assert!(pool.get(SignalId::new(a, 1)).is_some());
    }

    #[test]
    fn test_take_and_restore() {
        let mut arena = Arena::new();
        let a = arena.insert(());
        let mut pool = SignalPool::new();
        pool.insert_machine(a, buffers(&[1], &[]));
        let signal = SignalId::new(a, 0);

        let mut buffer = pool.take(signal).unwrap();
        assert!(pool.get(signal).unwrap().is_empty());
        buffer.as_f32_mut().unwrap()[0] = 1.0;
        pool.restore(signal, buffer);
        assert_eq!(pool.get(signal).unwrap().as_f32().unwrap()[0], 1.0);
    }

    #[test]
    fn test_premix_sums_sources() {
        let mut arena = Arena::new();
        let a = arena.insert(());
        let b = arena.insert(());
        let sink = arena.insert(());
        let mut pool = SignalPool::new();
        pool.insert_machine(a, buffers(&[1], &[]));
        pool.insert_machine(b, buffers(&[2], &[]));
        pool.insert_machine(sink, buffers(&[], &[(0, 2)]));

        pool.get_mut(SignalId::new(a, 0)).unwrap().as_f32_mut().unwrap().fill(0.25);
        pool.get_mut(SignalId::new(b, 0)).unwrap().as_f32_mut().unwrap().fill(0.5);

        let sources = [SignalId::new(a, 0), SignalId::new(b, 0)];
        pool.mix_input(sink, 0, &sources);
        pool.mix_input(sink, 0, &sources);
        let mixed = pool.premix(sink, 0).unwrap().as_f32().unwrap();
        assert!(mixed.iter().all(|&s| (s - 0.75).abs() < 1e-6));

        let inputs = vec![InputSlot {
            descriptor: InputDescriptor::premixed("Stereo", Dimension::Audio, 2),
            sources: sources.to_vec(),
        }];
        let view = InputView::new(&pool, sink, &inputs);
        assert_eq!(view.input_source_count("Stereo"), 2);
        assert_eq!(view.input("Stereo").unwrap().channels(), 2);
        assert_eq!(view.input_source("Stereo", 0).unwrap().channels(), 1);
        assert!(view.input_source("Stereo", 2).is_none());
        assert!(view.input("Mono").is_none());
    }

    #[test]
    fn test_reallocate_only_touches_dimension() {
        let mut arena = Arena::new();
        let a = arena.insert(());
        let mut pool = SignalPool::new();
        pool.insert_machine(a, buffers(&[2], &[(0, 2)]));
        let midi = SignalBuffer::allocate(
            Dimension::Midi,
            1,
            SignalDefaults::new(4, Resolution::Pointer, 44100),
        )
        .unwrap();
        pool.signals.insert(SignalId::new(a, 1), midi);

        pool.reallocate(Dimension::Audio, audio(16)).unwrap();
        assert_eq!(pool.get(SignalId::new(a, 0)).unwrap().samples(), 16);
        assert_eq!(pool.premix(a, 0).unwrap().samples(), 16);
        assert_eq!(pool.get(SignalId::new(a, 1)).unwrap().samples(), 4);
    }
}
