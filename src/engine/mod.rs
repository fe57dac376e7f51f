//! Engine module
//!
//! The machine graph, its scheduler and the plumbing around it.
//! Handles graph mutation, render-chain ordering, the operation channel that
//! serializes access against the audio thread, async offload, timing, and the
//! cpal/midir back-ends.

pub mod arena;
pub mod async_ops;
pub mod audio_engine;
pub mod commands;
pub mod error;
pub mod facade;
pub mod handle;
pub mod listeners;
pub mod machine;
pub mod midi_engine;
pub mod operations;
pub mod render_chain;
pub mod signal_pool;
pub mod space;
pub mod static_signals;
pub mod timing;

pub use arena::MachineId;
pub use async_ops::{AsyncJob, AsyncOps, AsyncTicket};
pub use audio_engine::{AudioBackend, AudioError, DeviceInfo};
pub use commands::{event_channel, EngineEvent, EventReceiver, EventSender, DEFAULT_EVENT_BUFFER_SIZE};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use facade::{Engine, InputConnections};
pub use handle::HostHandle;
pub use listeners::{MachineRef, MachineSetListener};
pub use midi_engine::{MidiDeviceInfo, MidiError, MidiInput};
pub use operations::{abort_on_fatal, FatalHandler, Mode};
pub use space::{MachineSpace, SinkStatus};
pub use static_signals::{StaticSignal, STATIC_SIGNAL_SLOTS};
pub use timing::{EngineState, PeriodicCallback};
