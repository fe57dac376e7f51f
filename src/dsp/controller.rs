//! Controllers: typed accessors bound to plugin parameter slots.
//!
//! A plugin describes its parameters with [`ControllerDefinition`]s and hands
//! out mutable [`ControllerSlot`]s on request. The host wraps each definition
//! in a [`Controller`], which adds range checking and an optional MIDI binding.

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};

/// Highest static signal slot a `SignalId` controller may reference.
pub const MAX_SIGNAL_ID: i32 = 255;

/// Logical type of a controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerKind {
    Int,
    Float,
    Bool,
    String,
    /// Integer with a name for each value.
    Enum,
    /// Integer referring to a static signal slot.
    SignalId,
}

/// A controller value, as read or written through the operation channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ControllerValue {
    Int(i32),
    Float(f32),
    Bool(bool),
    String(String),
}

/// Mutable view of a plugin's backing storage for one controller.
#[derive(Debug)]
pub enum ControllerSlot<'a> {
    Int(&'a mut i32),
    Float(&'a mut f32),
    Bool(&'a mut bool),
    String(&'a mut String),
}

/// Static description of a controller exposed by a plugin.
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerDefinition {
    /// Unique name within the machine.
    pub name: &'static str,
    /// Human-readable title.
    pub title: &'static str,
    /// Group used to organize controllers in a UI.
    pub group: &'static str,
    pub kind: ControllerKind,
    pub min_i: i32,
    pub max_i: i32,
    pub min_f: f32,
    pub max_f: f32,
    pub step_f: f32,
    /// Names for `Enum` values.
    pub enum_names: Vec<(i32, &'static str)>,
}

impl ControllerDefinition {
    fn base(name: &'static str, title: &'static str, kind: ControllerKind) -> Self {
        Self {
            name,
            title,
            group: "",
            kind,
            min_i: -32768,
            max_i: 32767,
            min_f: 0.0,
            max_f: 1.0,
            step_f: 0.1,
            enum_names: Vec::new(),
        }
    }

    /// Integer controller with an inclusive range.
    pub fn int(name: &'static str, title: &'static str, min: i32, max: i32) -> Self {
        Self {
            min_i: min,
            max_i: max,
            ..Self::base(name, title, ControllerKind::Int)
        }
    }

    /// Float controller with an inclusive range; the step defaults to a tenth of the range.
    pub fn float(name: &'static str, title: &'static str, min: f32, max: f32) -> Self {
        Self {
            min_f: min,
            max_f: max,
            step_f: (max - min) / 10.0,
            ..Self::base(name, title, ControllerKind::Float)
        }
    }

    pub fn boolean(name: &'static str, title: &'static str) -> Self {
        Self::base(name, title, ControllerKind::Bool)
    }

    pub fn string(name: &'static str, title: &'static str) -> Self {
        Self::base(name, title, ControllerKind::String)
    }

    /// Enumeration over the given (value, name) pairs.
    pub fn enumeration(
        name: &'static str,
        title: &'static str,
        names: &[(i32, &'static str)],
    ) -> Self {
        let min_i = names.iter().map(|(v, _)| *v).min().unwrap_or(0);
        let max_i = names.iter().map(|(v, _)| *v).max().unwrap_or(0);
        Self {
            min_i,
            max_i,
            enum_names: names.to_vec(),
            ..Self::base(name, title, ControllerKind::Enum)
        }
    }

    /// Reference to a static signal slot (0..=255).
    pub fn signal_id(name: &'static str, title: &'static str) -> Self {
        Self {
            min_i: 0,
            max_i: MAX_SIGNAL_ID,
            ..Self::base(name, title, ControllerKind::SignalId)
        }
    }

    /// Overrides the float step.
    pub fn with_step(mut self, step: f32) -> Self {
        self.step_f = step;
        self
    }

    /// Places the controller in a group.
    pub fn in_group(mut self, group: &'static str) -> Self {
        self.group = group;
        self
    }

    /// Returns true if `value` lies within the controller's bounds.
    pub fn accepts(&self, value: &ControllerValue) -> bool {
        match (self.kind, value) {
            (ControllerKind::Int | ControllerKind::Enum | ControllerKind::SignalId, ControllerValue::Int(v)) => {
                (self.min_i..=self.max_i).contains(v)
            }
            (ControllerKind::Float, ControllerValue::Float(v)) => {
                *v >= self.min_f && *v <= self.max_f
            }
            (ControllerKind::Bool, ControllerValue::Bool(_)) => true,
            (ControllerKind::String, ControllerValue::String(_)) => true,
            _ => false,
        }
    }
}

/// MIDI continuous-controller numbers bound to a controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiBinding {
    /// Coarse (MSB) controller number.
    pub coarse: u8,
    /// Optional fine (LSB) controller number for 14-bit resolution.
    pub fine: Option<u8>,
}

/// A controller instance owned by a machine.
#[derive(Clone, Debug)]
pub struct Controller {
    definition: ControllerDefinition,
    midi: Option<MidiBinding>,
    /// Last coarse/fine values received, used to assemble 14-bit values.
    midi_state: (u8, u8),
}

impl Controller {
    pub fn new(definition: ControllerDefinition) -> Self {
        Self {
            definition,
            midi: None,
            midi_state: (0, 0),
        }
    }

    pub fn definition(&self) -> &ControllerDefinition {
        &self.definition
    }

    pub fn name(&self) -> &'static str {
        self.definition.name
    }

    pub fn title(&self) -> &'static str {
        self.definition.title
    }

    pub fn kind(&self) -> ControllerKind {
        self.definition.kind
    }

    pub fn midi_binding(&self) -> Option<MidiBinding> {
        self.midi
    }

    /// Binds this controller to a MIDI coarse/fine controller pair.
    ///
    /// A controller can only be bound once. Both numbers must be in 0..=127
    /// and must differ.
    pub fn set_midi_controller(&mut self, coarse: i32, fine: Option<i32>) -> EngineResult<()> {
        if self.midi.is_some() {
            return Err(EngineError::sanity(
                "Controller already mapped to MIDI controller!",
            ));
        }
        let valid = |v: i32| (0..=127).contains(&v);
        if !valid(coarse) || fine.is_some_and(|f| !valid(f) || f == coarse) {
            return Err(EngineError::sanity(
                "Trying to set illegal MIDI controller values.",
            ));
        }
        self.midi = Some(MidiBinding {
            coarse: coarse as u8,
            fine: fine.map(|f| f as u8),
        });
        Ok(())
    }

    /// Maps an incoming control-change message to a controller value.
    ///
    /// Returns `None` if the message does not address this controller.
    pub fn midi_value(&mut self, controller: u8, value: u8) -> Option<ControllerValue> {
        let binding = self.midi?;
        if controller == binding.coarse {
            self.midi_state.0 = value;
        } else if Some(controller) == binding.fine {
            self.midi_state.1 = value;
        } else {
            return None;
        }

        let position = match binding.fine {
            Some(_) => ((self.midi_state.0 as u32) << 7 | self.midi_state.1 as u32) as f32 / 16383.0,
            None => self.midi_state.0 as f32 / 127.0,
        };

        let def = &self.definition;
        Some(match def.kind {
            ControllerKind::Float => {
                ControllerValue::Float(def.min_f + position * (def.max_f - def.min_f))
            }
            ControllerKind::Int | ControllerKind::Enum | ControllerKind::SignalId => {
                let span = (def.max_i - def.min_i) as f32;
                ControllerValue::Int(def.min_i + (position * span).round() as i32)
            }
            ControllerKind::Bool => ControllerValue::Bool(position >= 0.5),
            ControllerKind::String => return None,
        })
    }

    /// Writes a value into the plugin slot if it is within bounds.
    ///
    /// Out-of-range numbers are ignored. A value of the wrong type is an error.
    pub fn write(&self, slot: ControllerSlot<'_>, value: &ControllerValue) -> EngineResult<()> {
        match (slot, value) {
            (ControllerSlot::Int(dst), ControllerValue::Int(v)) => {
                if self.definition.accepts(value) {
                    *dst = *v;
                }
            }
            (ControllerSlot::Float(dst), ControllerValue::Float(v)) => {
                if self.definition.accepts(value) {
                    *dst = *v;
                }
            }
            (ControllerSlot::Bool(dst), ControllerValue::Bool(v)) => *dst = *v,
            (ControllerSlot::String(dst), ControllerValue::String(v)) => dst.clone_from(v),
            _ => {
                return Err(EngineError::sanity(format!(
                    "controller [{}] does not hold a value of that type",
                    self.name()
                )))
            }
        }
        Ok(())
    }

    /// Reads the current value out of the plugin slot.
    pub fn read(slot: ControllerSlot<'_>) -> ControllerValue {
        match slot {
            ControllerSlot::Int(v) => ControllerValue::Int(*v),
            ControllerSlot::Float(v) => ControllerValue::Float(*v),
            ControllerSlot::Bool(v) => ControllerValue::Bool(*v),
            ControllerSlot::String(v) => ControllerValue::String(v.clone()),
        }
    }

    /// Display name for an enum value.
    ///
    /// `SignalId` controllers use [`signal_value_name`] instead, since they need
    /// the static signal table.
    pub fn enum_value_name(&self, value: i32) -> EngineResult<&'static str> {
        self.definition
            .enum_names
            .iter()
            .find(|(v, _)| *v == value)
            .map(|(_, name)| *name)
            .ok_or_else(|| EngineError::sanity("Value out of range for enum."))
    }
}

/// Display name for a `SignalId` value given the loaded signal's name, if any.
pub fn signal_value_name(value: i32, loaded: Option<&str>) -> String {
    match loaded {
        Some(name) => format!("[{}] {}", value, name),
        None => format!("[{}] no file loaded", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_default_step() {
        let def = ControllerDefinition::float("cutoff", "Cutoff", 0.0, 2.0);
        assert!((def.step_f - 0.2).abs() < f32::EPSILON);
        let def = def.with_step(0.5);
        assert_eq!(def.step_f, 0.5);
    }

    #[test]
    fn test_signal_id_range() {
        let def = ControllerDefinition::signal_id("sample", "Sample");
        assert!(def.accepts(&ControllerValue::Int(0)));
        assert!(def.accepts(&ControllerValue::Int(255)));
        assert!(!def.accepts(&ControllerValue::Int(256)));
    }

    #[test]
    fn test_out_of_range_write_is_ignored() {
        let ctrl = Controller::new(ControllerDefinition::int("steps", "Steps", 1, 16));
        let mut storage = 4;
        ctrl.write(ControllerSlot::Int(&mut storage), &ControllerValue::Int(32))
            .unwrap();
        assert_eq!(storage, 4);
        ctrl.write(ControllerSlot::Int(&mut storage), &ControllerValue::Int(8))
            .unwrap();
        assert_eq!(storage, 8);

        let ctrl = Controller::new(ControllerDefinition::float("gain", "Gain", 0.0, 1.0));
        let mut level = 0.5;
        ctrl.write(ControllerSlot::Float(&mut level), &ControllerValue::Float(1.5))
            .unwrap();
        assert_eq!(level, 0.5);
    }

    #[test]
    fn test_type_mismatch_is_error() {
        let ctrl = Controller::new(ControllerDefinition::boolean("on", "On"));
        let mut flag = false;
        let err = ctrl
            .write(ControllerSlot::Bool(&mut flag), &ControllerValue::Int(1))
            .unwrap_err();
        assert_eq!(err.kind(), crate::engine::ErrorKind::SanityViolation);
    }

    #[test]
    fn test_midi_binding_rules() {
        let mut ctrl = Controller::new(ControllerDefinition::float("gain", "Gain", 0.0, 1.0));
        assert!(ctrl.set_midi_controller(128, None).is_err());
        assert!(ctrl.set_midi_controller(-1, None).is_err());
        assert!(ctrl.set_midi_controller(7, Some(7)).is_err());
        assert!(ctrl.set_midi_controller(7, Some(200)).is_err());
        assert!(ctrl.midi_binding().is_none());

        ctrl.set_midi_controller(7, Some(39)).unwrap();
        assert_eq!(
            ctrl.midi_binding(),
            Some(MidiBinding {
                coarse: 7,
                fine: Some(39)
            })
        );
        assert!(ctrl.set_midi_controller(1, None).is_err());
    }

    #[test]
    fn test_midi_value_mapping() {
        let mut ctrl = Controller::new(ControllerDefinition::int("note", "Note", 0, 127));
        ctrl.set_midi_controller(20, None).unwrap();
        assert_eq!(ctrl.midi_value(21, 64), None);
        assert_eq!(ctrl.midi_value(20, 127), Some(ControllerValue::Int(127)));
        assert_eq!(ctrl.midi_value(20, 0), Some(ControllerValue::Int(0)));

        let mut fine = Controller::new(ControllerDefinition::float("gain", "Gain", 0.0, 1.0));
        fine.set_midi_controller(7, Some(39)).unwrap();
        fine.midi_value(7, 127);
        match fine.midi_value(39, 127) {
            Some(ControllerValue::Float(v)) => assert!((v - 1.0).abs() < 1e-6),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_enum_names() {
        let ctrl = Controller::new(ControllerDefinition::enumeration(
            "wave",
            "Waveform",
            &[(0, "Sine"), (1, "Square"), (2, "Saw")],
        ));
        assert_eq!(ctrl.definition().max_i, 2);
        assert_eq!(ctrl.enum_value_name(1).unwrap(), "Square");
        assert!(ctrl.enum_value_name(5).is_err());
    }

    #[test]
    fn test_signal_value_name() {
        assert_eq!(signal_value_name(3, Some("kick.wav")), "[3] kick.wav");
        assert_eq!(signal_value_name(4, None), "[4] no file loaded");
    }
}
