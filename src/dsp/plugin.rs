//! The plugin contract implemented by every machine type.
//!
//! A plugin is created through its registered factory, receives a
//! [`PluginContext`] at construction, and runs one period at a time through
//! [`Plugin::execute`] using the buffers offered by [`Services`]. Dropping the
//! plugin releases the instance.

use std::sync::Arc;

use thiserror::Error;

use super::controller::{ControllerDefinition, ControllerSlot};
use super::math::MathTables;
use super::port::{InputDescriptor, OutputDescriptor};
use super::services::Services;
use super::signal::DefaultsTable;
use crate::engine::handle::HostHandle;

/// Category of a machine type, used for organization in listings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MachineCategory {
    /// Sound sources (oscillators, samplers, sequencers).
    Source,
    /// Frequency-shaping machines (filters, EQs).
    Filter,
    /// Audio effects (delay, reverb, distortion).
    Effect,
    /// Utility machines (mixers, gain, routing).
    Utility,
    /// Sinks that hand audio to a driver.
    Sink,
}

impl MachineCategory {
    /// Returns a human-readable name for the category.
    pub fn name(&self) -> &'static str {
        match self {
            MachineCategory::Source => "Source",
            MachineCategory::Filter => "Filter",
            MachineCategory::Effect => "Effect",
            MachineCategory::Utility => "Utility",
            MachineCategory::Sink => "Sink",
        }
    }
}

/// Static information about a machine type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineInfo {
    /// Registry key (e.g., "osc.sine", "io.live_out").
    pub id: &'static str,
    /// Base used to derive default instance names (e.g., "Sine").
    pub base_name: &'static str,
    /// The category this type belongs to.
    pub category: MachineCategory,
    /// A brief description of what the machine does.
    pub description: &'static str,
}

impl MachineInfo {
    pub fn new(
        id: &'static str,
        base_name: &'static str,
        category: MachineCategory,
        description: &'static str,
    ) -> Self {
        Self {
            id,
            base_name,
            category,
            description,
        }
    }

    /// Returns true if instances of this type can be registered as the sink.
    pub fn is_sink(&self) -> bool {
        self.category == MachineCategory::Sink
    }
}

/// Errors raised by plugins.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PluginError {
    /// Instance creation failed.
    #[error("failed to create instance: {0}")]
    InitFailed(String),
    /// Something went wrong while processing.
    #[error("{0}")]
    Failed(String),
}

/// Everything a plugin receives when an instance is created.
pub struct PluginContext {
    /// Unique instance name the machine will be registered under.
    pub instance_name: String,
    /// Current per-dimension signal defaults.
    pub defaults: DefaultsTable,
    /// Shared math services.
    pub math: Arc<MathTables>,
    /// Handle back into the engine, for sinks that drive their own audio thread.
    pub host: HostHandle,
}

/// Interleaved audio exposed by a sink.
#[derive(Clone, Copy, Debug)]
pub struct SinkOutput<'a> {
    pub samples: &'a [f32],
    pub channels: usize,
}

/// The trait every machine type implements.
///
/// # Thread Safety
///
/// `Plugin` requires `Send + 'static` because instances are created on a control
/// thread and executed on the audio thread.
///
/// # Real-time Constraints
///
/// `execute` and `reset` run on the audio thread while real-time mode is active
/// and must not allocate, block, or perform I/O.
pub trait Plugin: Send + 'static {
    /// Returns static information about this machine type.
    fn info(&self) -> &MachineInfo;

    /// Input descriptions, checked on attach.
    fn inputs(&self) -> &[InputDescriptor];

    /// Output descriptions; one signal is allocated for each.
    fn outputs(&self) -> &[OutputDescriptor];

    /// Controllers this plugin exposes.
    fn controllers(&self) -> &[ControllerDefinition];

    /// Mutable access to the storage behind a controller.
    ///
    /// Returns `None` if the plugin has no controller of that name.
    fn controller_slot(&mut self, name: &str) -> Option<ControllerSlot<'_>>;

    /// Called whenever the process-wide signal defaults change.
    ///
    /// Plugins with internal buffers sized from the defaults resize them here.
    fn prepare(&mut self, _defaults: &DefaultsTable) {}

    /// Re-initializes transient state (envelopes, delay lines) without reallocating.
    fn reset(&mut self);

    /// Processes exactly one period.
    fn execute(&mut self, services: &mut Services<'_>) -> Result<(), PluginError>;

    /// Interleaved audio for the driver, for sinks. `None` for other machines.
    fn sink_output(&self) -> Option<SinkOutput<'_>> {
        None
    }

    /// Free-form hint shown alongside the machine.
    fn hint(&self) -> &str {
        ""
    }
}

/// A plugin type that can be registered by its type alone.
pub trait PluginType: Plugin + Sized {
    /// Static information, available without an instance.
    fn descriptor() -> MachineInfo;

    /// Creates a new instance.
    fn init(context: &PluginContext) -> Result<Self, PluginError>;
}
