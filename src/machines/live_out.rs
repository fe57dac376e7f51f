//! Live output sink.
//!
//! The final destination of the render chain. It collects everything attached
//! to its premixed stereo input into an interleaved buffer that the audio
//! back-end reads through [`Plugin::sink_output`].

use crate::dsp::controller::{ControllerDefinition, ControllerSlot};
use crate::dsp::plugin::{
    MachineCategory, MachineInfo, Plugin, PluginContext, PluginError, PluginType, SinkOutput,
};
use crate::dsp::port::{InputDescriptor, OutputDescriptor};
use crate::dsp::services::Services;
use crate::dsp::signal::{DefaultsTable, Dimension};

static INFO: MachineInfo = MachineInfo {
    id: "io.live_out",
    base_name: "LiveOut",
    category: MachineCategory::Sink,
    description: "Routes the mix to the audio device",
};

const CHANNELS: usize = 2;

pub struct LiveOut {
    volume: f32,
    /// Interleaved stereo, one period long.
    buffer: Vec<f32>,
    inputs: Vec<InputDescriptor>,
    controllers: Vec<ControllerDefinition>,
}

impl LiveOut {
    pub fn new(defaults: &DefaultsTable) -> Self {
        let mut out = Self {
            volume: 1.0,
            buffer: Vec::new(),
            inputs: vec![InputDescriptor::premixed("Stereo", Dimension::Audio, CHANNELS)],
            controllers: vec![ControllerDefinition::float("volume", "Volume", 0.0, 1.0)],
        };
        out.prepare(defaults);
        out
    }
}

impl Plugin for LiveOut {
    fn info(&self) -> &MachineInfo {
        &INFO
    }

    fn inputs(&self) -> &[InputDescriptor] {
        &self.inputs
    }

    fn outputs(&self) -> &[OutputDescriptor] {
        &[]
    }

    fn controllers(&self) -> &[ControllerDefinition] {
        &self.controllers
    }

    fn controller_slot(&mut self, name: &str) -> Option<ControllerSlot<'_>> {
        match name {
            "volume" => Some(ControllerSlot::Float(&mut self.volume)),
            _ => None,
        }
    }

    fn prepare(&mut self, defaults: &DefaultsTable) {
        let samples = defaults[Dimension::Audio.index()].map_or(0, |d| d.samples);
        self.buffer.clear();
        self.buffer.resize(samples * CHANNELS, 0.0);
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
    }

    fn execute(&mut self, services: &mut Services<'_>) -> Result<(), PluginError> {
        match services.input("Stereo").and_then(|b| b.as_f32()) {
            Some(input) => {
                for (o, i) in self.buffer.iter_mut().zip(input) {
                    *o = i * self.volume;
                }
            }
            None => self.buffer.fill(0.0),
        }
        Ok(())
    }

    fn sink_output(&self) -> Option<SinkOutput<'_>> {
        Some(SinkOutput {
            samples: &self.buffer,
            channels: CHANNELS,
        })
    }
}

impl PluginType for LiveOut {
    fn descriptor() -> MachineInfo {
        INFO.clone()
    }

    fn init(context: &PluginContext) -> Result<Self, PluginError> {
        Ok(Self::new(&context.defaults))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::signal::{builtin_defaults, Resolution, SignalDefaults};
    use crate::machines::testing::{execute, execute_with, OneInput};

    fn defaults(samples: usize) -> DefaultsTable {
        let mut table = builtin_defaults();
        table[Dimension::Audio.index()] = Some(SignalDefaults::new(samples, Resolution::Float32, 44100));
        table
    }

    #[test]
    fn test_live_out_is_a_sink() {
        let out = LiveOut::new(&defaults(16));
        assert!(out.info().is_sink());
        let sink = out.sink_output().unwrap();
        assert_eq!(sink.channels, 2);
        assert_eq!(sink.samples.len(), 32);
    }

    #[test]
    fn test_live_out_copies_input_with_volume() {
        let mut out = LiveOut::new(&defaults(4));
        out.volume = 0.5;
        let input = OneInput::filled("Stereo", 2, 4, 0.6);
        execute_with(&mut out, &input, &mut []).unwrap();
        assert!(out
            .sink_output()
            .unwrap()
            .samples
            .iter()
            .all(|s| (s - 0.3).abs() < 1e-6));

        execute(&mut out, &mut []).unwrap();
        assert!(out.sink_output().unwrap().samples.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_prepare_resizes_buffer() {
        let mut out = LiveOut::new(&defaults(4));
        out.prepare(&defaults(64));
        assert_eq!(out.sink_output().unwrap().samples.len(), 128);
    }
}
