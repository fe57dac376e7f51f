//! Project serialization for save/load.
//!
//! A project captures the complete state of the machine set: scheduler
//! settings, every machine with its position, controller values and MIDI
//! bindings, the connections between them, tight coupling and the static
//! signal table.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::dsp::controller::{ControllerValue, MidiBinding};
use crate::engine::error::EngineError;
use crate::engine::facade::Engine;
use crate::engine::space::MachineSpace;
use crate::engine::static_signals::StaticSignal;
use crate::engine::timing::{
    check_bpm, check_loop_length, check_loop_start, check_lpb, check_shuffle,
};

/// Highest project interface level this build reads and the level it writes.
pub const PROJECT_INTERFACE_LEVEL: u32 = 7;

/// A complete project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub interface_level: u32,
    pub state: SchedulerData,
    pub machines: Vec<MachineData>,
    pub connections: Vec<ConnectionData>,
    /// Pairs of tightly connected machines.
    #[serde(default)]
    pub tight: Vec<(String, String)>,
    #[serde(default)]
    pub static_signals: Vec<StaticSlot>,
}

impl Project {
    /// An empty project at the current interface level.
    pub fn new() -> Self {
        Self {
            interface_level: PROJECT_INTERFACE_LEVEL,
            state: SchedulerData::default(),
            machines: Vec::new(),
            connections: Vec::new(),
            tight: Vec::new(),
            static_signals: Vec::new(),
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.interface_level <= PROJECT_INTERFACE_LEVEL
    }
}

impl Default for Project {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerData {
    pub bpm: i32,
    pub lpb: i32,
    pub loop_start: i32,
    pub loop_length: i32,
    pub looping: bool,
    pub shuffle: i32,
}

impl SchedulerData {
    /// Rejects tempo and loop values the scheduler would refuse, before
    /// anything in the engine is touched.
    pub fn validate(&self) -> Result<(), EngineError> {
        check_bpm(self.bpm)?;
        check_lpb(self.lpb)?;
        check_loop_start(self.loop_start)?;
        check_loop_length(self.loop_length)?;
        check_shuffle(self.shuffle)
    }
}

impl Default for SchedulerData {
    fn default() -> Self {
        Self {
            bpm: 120,
            lpb: 4,
            loop_start: 0,
            loop_length: 64,
            looping: true,
            shuffle: 0,
        }
    }
}

/// One machine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineData {
    /// Registry type id (e.g. "osc.sine").
    pub type_id: String,
    pub name: String,
    pub position: (f32, f32),
    pub controllers: Vec<ControllerData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerData {
    pub name: String,
    pub value: ControllerValue,
    #[serde(default)]
    pub midi: Option<MidiBinding>,
}

/// A signal from `source`.`output` into `destination`.`input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionData {
    pub source: String,
    pub output: String,
    pub destination: String,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticSlot {
    pub index: i32,
    pub signal: StaticSignal,
}

/// Error type for project operations.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("File error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Incompatible project interface level: found {found}, supported <= {supported}")]
    IncompatibleLevel { found: u32, supported: u32 },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<ProjectError> for EngineError {
    fn from(err: ProjectError) -> Self {
        match err {
            ProjectError::Engine(inner) => inner,
            other => EngineError::SyscallFailure(other.to_string()),
        }
    }
}

/// Save a project to a JSON file.
pub fn save_to_file(project: &Project, path: &Path) -> Result<(), ProjectError> {
    let json = serde_json::to_string_pretty(project)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Load a project from a JSON file, refusing newer interface levels.
pub fn load_from_file(path: &Path) -> Result<Project, ProjectError> {
    let json = std::fs::read_to_string(path)?;
    let project: Project = serde_json::from_str(&json)?;
    if !project.is_compatible() {
        return Err(ProjectError::IncompatibleLevel {
            found: project.interface_level,
            supported: PROJECT_INTERFACE_LEVEL,
        });
    }
    Ok(project)
}

/// Takes a consistent snapshot of the engine's machine set.
pub fn capture(engine: &Engine) -> Result<Project, ProjectError> {
    Ok(engine.update(capture_space)?)
}

fn capture_space(space: &mut MachineSpace) -> Result<Project, EngineError> {
    let state = space.state();
    let mut project = Project::new();
    project.state = SchedulerData {
        bpm: state.bpm(),
        lpb: state.lpb(),
        loop_start: state.loop_start(),
        loop_length: state.loop_length(),
        looping: state.is_looping(),
        shuffle: state.shuffle(),
    };

    for name in space.machine_names() {
        let mut controllers = Vec::new();
        for controller in space.controller_names(&name, None)? {
            let value = space.get_controller(&name, &controller)?;
            let midi = space.midi_binding(&name, &controller)?;
            controllers.push(ControllerData {
                name: controller,
                value,
                midi,
            });
        }

        for (input, sources) in space.input_connections(&name)? {
            for (source, output) in sources {
                project.connections.push(ConnectionData {
                    source,
                    output,
                    destination: name.clone(),
                    input: input.clone(),
                });
            }
        }

        for partner in space.tightly_connected(&name)? {
            if name < partner {
                project.tight.push((name.clone(), partner));
            }
        }

        project.machines.push(MachineData {
            type_id: space.type_of(&name)?.to_string(),
            position: space.position(&name)?,
            name,
            controllers,
        });
    }

    project.static_signals = space
        .static_signals()
        .iter()
        .map(|(index, signal)| StaticSlot {
            index,
            signal: signal.clone(),
        })
        .collect();
    Ok(project)
}

/// Replaces the engine's machine set with `project`.
///
/// The loading flag is raised for the duration; clearing it tells listeners
/// the project has loaded, also when restoring failed part way.
pub fn restore(engine: &Engine, project: &Project) -> Result<(), ProjectError> {
    if !project.is_compatible() {
        return Err(ProjectError::IncompatibleLevel {
            found: project.interface_level,
            supported: PROJECT_INTERFACE_LEVEL,
        });
    }

    project.state.validate()?;

    engine.set_loading(true)?;
    let result = restore_machines(engine, project);
    engine.set_loading(false)?;
    if let Err(err) = &result {
        warn!(error = %err, "project restore failed");
    } else {
        info!(machines = project.machines.len(), "project loaded");
    }
    result
}

fn restore_machines(engine: &Engine, project: &Project) -> Result<(), ProjectError> {
    engine.destroy_all_machines()?;

    let state = &project.state;
    engine.set_bpm(state.bpm)?;
    engine.set_lpb(state.lpb)?;
    engine.set_loop_start(state.loop_start)?;
    engine.set_loop_length(state.loop_length)?;
    engine.set_looping(state.looping)?;
    engine.set_shuffle(state.shuffle)?;

    for (index, _) in engine.static_signal_names()? {
        engine.clear_static_signal(index)?;
    }
    for slot in &project.static_signals {
        engine.set_static_signal(slot.index, slot.signal.clone())?;
    }

    for machine in &project.machines {
        let name = engine.create_machine(&machine.type_id, Some(&machine.name))?;
        let (x, y) = machine.position;
        engine.set_position(&name, x, y)?;
        for controller in &machine.controllers {
            engine.set_controller(&name, &controller.name, controller.value.clone())?;
            if let Some(binding) = controller.midi {
                engine.set_midi_controller(
                    &name,
                    &controller.name,
                    binding.coarse as i32,
                    binding.fine.map(i32::from),
                )?;
            }
        }
    }

    for c in &project.connections {
        engine.attach(&c.source, &c.output, &c.destination, &c.input)?;
    }
    for (a, b) in &project.tight {
        engine.tightly_connect(a, b)?;
    }
    Ok(())
}
