//! Machines module
//!
//! Built-in machine types: a sine oscillator, a stereo mixer and the live
//! output sink.

pub mod live_out;
pub mod mixer;
pub mod sine;

pub use live_out::LiveOut;
pub use mixer::Mixer;
pub use sine::SineOscillator;

use crate::dsp::registry::PluginRegistry;
use crate::engine::error::EngineResult;

/// Registers every built-in machine type.
pub fn register_builtin(registry: &mut PluginRegistry) -> EngineResult<()> {
    registry.register::<SineOscillator>()?;
    registry.register::<Mixer>()?;
    registry.register::<LiveOut>()?;
    Ok(())
}

/// A registry holding the built-in machine types.
pub fn builtin_registry() -> EngineResult<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    register_builtin(&mut registry)?;
    Ok(registry)
}
