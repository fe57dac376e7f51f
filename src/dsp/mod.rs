//! DSP module
//!
//! Core plugin-facing types.
//! Defines the Plugin trait, signal buffers, ports, controllers and the
//! services a plugin receives while it executes.

pub mod context;
pub mod controller;
pub mod math;
pub mod plugin;
pub mod port;
pub mod registry;
pub mod services;
pub mod signal;

pub use context::TransportSnapshot;
pub use controller::{
    Controller, ControllerDefinition, ControllerKind, ControllerSlot, ControllerValue,
    MidiBinding, MAX_SIGNAL_ID,
};
pub use math::{FftPlan, MathTables};
pub use plugin::{
    MachineCategory, MachineInfo, Plugin, PluginContext, PluginError, PluginType, SinkOutput,
};
pub use port::{InputDescriptor, OutputDescriptor};
pub use registry::{PluginFactory, PluginRegistry};
pub use services::{InputSource, NoInputs, OutputBuffer, Services};
pub use signal::{
    builtin_defaults, DefaultsTable, Dimension, MidiMessage, Resolution, SampleData,
    SignalBuffer, SignalDefaults,
};
