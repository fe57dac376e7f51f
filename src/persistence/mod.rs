//! Persistence module
//!
//! Project save/load functionality using serde and JSON.

pub mod project;

pub use project::{
    capture, load_from_file, restore, save_to_file, ConnectionData, ControllerData, MachineData,
    Project, ProjectError, SchedulerData, StaticSlot, PROJECT_INTERFACE_LEVEL,
};
