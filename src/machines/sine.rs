//! Sine oscillator.

use std::f32::consts::TAU;
use std::sync::Arc;

use crate::dsp::controller::{ControllerDefinition, ControllerSlot};
use crate::dsp::math::MathTables;
use crate::dsp::plugin::{MachineCategory, MachineInfo, Plugin, PluginContext, PluginError, PluginType};
use crate::dsp::port::{InputDescriptor, OutputDescriptor};
use crate::dsp::services::Services;
use crate::dsp::signal::Dimension;

static INFO: MachineInfo = MachineInfo {
    id: "osc.sine",
    base_name: "Sine",
    category: MachineCategory::Source,
    description: "A pure sine wave oscillator",
};

/// A table-driven sine generator with a mono audio output.
///
/// # Controllers
///
/// - **frequency** (20-20000 Hz, default 440)
/// - **amplitude** (0-1, default 0.5)
pub struct SineOscillator {
    /// Phase accumulator in cycles, kept in [0, 1).
    phase: f32,
    frequency: f32,
    amplitude: f32,
    math: Arc<MathTables>,
    outputs: Vec<OutputDescriptor>,
    controllers: Vec<ControllerDefinition>,
}

impl SineOscillator {
    pub fn new(math: Arc<MathTables>) -> Self {
        Self {
            phase: 0.0,
            math,
            frequency: 440.0,
            amplitude: 0.5,
            outputs: vec![OutputDescriptor::new("Mono", Dimension::Audio, 1)],
            controllers: vec![
                ControllerDefinition::float("frequency", "Frequency", 20.0, 20000.0),
                ControllerDefinition::float("amplitude", "Amplitude", 0.0, 1.0),
            ],
        }
    }
}

impl Plugin for SineOscillator {
    fn info(&self) -> &MachineInfo {
        &INFO
    }

    fn inputs(&self) -> &[InputDescriptor] {
        &[]
    }

    fn outputs(&self) -> &[OutputDescriptor] {
        &self.outputs
    }

    fn controllers(&self) -> &[ControllerDefinition] {
        &self.controllers
    }

    fn controller_slot(&mut self, name: &str) -> Option<ControllerSlot<'_>> {
        match name {
            "frequency" => Some(ControllerSlot::Float(&mut self.frequency)),
            "amplitude" => Some(ControllerSlot::Float(&mut self.amplitude)),
            _ => None,
        }
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }

    fn execute(&mut self, services: &mut Services<'_>) -> Result<(), PluginError> {
        let Some(out) = services.output("Mono") else {
            return Ok(());
        };
        let rate = out.frequency().max(1) as f32;
        let increment = self.frequency / rate;
        let Some(samples) = out.as_f32_mut() else {
            return Err(PluginError::Failed("Mono output is not a float signal".into()));
        };
        for sample in samples.iter_mut() {
            *sample = self.math.sin(self.phase * TAU) * self.amplitude;
            self.phase = (self.phase + increment).fract();
        }
        Ok(())
    }
}

impl PluginType for SineOscillator {
    fn descriptor() -> MachineInfo {
        INFO.clone()
    }

    fn init(context: &PluginContext) -> Result<Self, PluginError> {
        Ok(Self::new(Arc::clone(&context.math)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machines::testing::{execute, float_output};

    #[test]
    fn test_sine_info() {
        let osc = SineOscillator::new(Arc::new(MathTables::new()));
        assert_eq!(osc.info().id, "osc.sine");
        assert_eq!(osc.info().base_name, "Sine");
        assert_eq!(osc.outputs()[0].name, "Mono");
        assert_eq!(osc.controllers().len(), 2);
    }

    #[test]
    fn test_sine_generates_bounded_output() {
        let mut osc = SineOscillator::new(Arc::new(MathTables::new()));
        let mut outputs = vec![float_output("Mono", 1, 256)];
        execute(&mut osc, &mut outputs).unwrap();

        let samples = outputs[0].buffer.as_f32().unwrap();
        assert!(samples.iter().all(|s| s.abs() <= 0.5 + 1e-6));
        assert!(samples.iter().any(|s| s.abs() > 0.3));
        assert_eq!(samples[0], 0.0);
    }

    #[test]
    fn test_sine_reset_restarts_phase() {
        let mut osc = SineOscillator::new(Arc::new(MathTables::new()));
        let mut first = vec![float_output("Mono", 1, 64)];
        execute(&mut osc, &mut first).unwrap();
        let mut second = vec![float_output("Mono", 1, 64)];
        execute(&mut osc, &mut second).unwrap();
        assert_ne!(first[0].buffer, second[0].buffer);

        osc.reset();
        let mut again = vec![float_output("Mono", 1, 64)];
        execute(&mut osc, &mut again).unwrap();
        assert_eq!(first[0].buffer, again[0].buffer);
    }
}
