//! Stereo mixer.

use crate::dsp::controller::{ControllerDefinition, ControllerSlot};
use crate::dsp::plugin::{MachineCategory, MachineInfo, Plugin, PluginContext, PluginError, PluginType};
use crate::dsp::port::{InputDescriptor, OutputDescriptor};
use crate::dsp::services::Services;
use crate::dsp::signal::Dimension;

static INFO: MachineInfo = MachineInfo {
    id: "util.mixer",
    base_name: "Mixer",
    category: MachineCategory::Utility,
    description: "Sums every attached signal and applies a gain",
};

/// Sums its producers through a premixed stereo input and scales the result.
pub struct Mixer {
    gain: f32,
    inputs: Vec<InputDescriptor>,
    outputs: Vec<OutputDescriptor>,
    controllers: Vec<ControllerDefinition>,
}

impl Mixer {
    pub fn new() -> Self {
        Self {
            gain: 1.0,
            inputs: vec![InputDescriptor::premixed("Stereo", Dimension::Audio, 2)],
            outputs: vec![OutputDescriptor::new("Stereo", Dimension::Audio, 2)],
            controllers: vec![ControllerDefinition::float("gain", "Gain", 0.0, 2.0)],
        }
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for Mixer {
    fn info(&self) -> &MachineInfo {
        &INFO
    }

    fn inputs(&self) -> &[InputDescriptor] {
        &self.inputs
    }

    fn outputs(&self) -> &[OutputDescriptor] {
        &self.outputs
    }

    fn controllers(&self) -> &[ControllerDefinition] {
        &self.controllers
    }

    fn controller_slot(&mut self, name: &str) -> Option<ControllerSlot<'_>> {
        match name {
            "gain" => Some(ControllerSlot::Float(&mut self.gain)),
            _ => None,
        }
    }

    fn reset(&mut self) {}

    fn execute(&mut self, services: &mut Services<'_>) -> Result<(), PluginError> {
        let gain = self.gain;
        match services.io("Stereo", "Stereo") {
            (Some(input), Some(output)) => {
                if let (Some(i), Some(o)) = (input.as_f32(), output.as_f32_mut()) {
                    for (o, i) in o.iter_mut().zip(i) {
                        *o = i * gain;
                    }
                }
            }
            (None, Some(output)) => output.clear(),
            _ => {}
        }
        Ok(())
    }
}

impl PluginType for Mixer {
    fn descriptor() -> MachineInfo {
        INFO.clone()
    }

    fn init(_context: &PluginContext) -> Result<Self, PluginError> {
        Ok(Self::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machines::testing::{execute, execute_with, float_output, OneInput};

    #[test]
    fn test_mixer_applies_gain() {
        let mut mixer = Mixer::new();
        mixer.gain = 0.5;
        let input = OneInput::filled("Stereo", 2, 8, 0.8);
        let mut outputs = vec![float_output("Stereo", 2, 8)];
        execute_with(&mut mixer, &input, &mut outputs).unwrap();
        assert!(outputs[0]
            .buffer
            .as_f32()
            .unwrap()
            .iter()
            .all(|s| (s - 0.4).abs() < 1e-6));
    }

    #[test]
    fn test_mixer_without_input_is_silent() {
        let mut mixer = Mixer::new();
        let mut outputs = vec![float_output("Stereo", 2, 8)];
        outputs[0].buffer.as_f32_mut().unwrap().fill(1.0);
        execute(&mut mixer, &mut outputs).unwrap();
        assert!(outputs[0].buffer.as_f32().unwrap().iter().all(|s| *s == 0.0));
    }
}
