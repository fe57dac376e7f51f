//! Engine configuration.
//!
//! Loaded from JSON. Every field is optional in the file; missing ones take the
//! built-in defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dsp::signal::{DefaultsTable, Dimension, SignalDefaults};
use crate::engine::commands::DEFAULT_EVENT_BUFFER_SIZE;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::operations::{DEFAULT_DRAIN_LIMIT, DEFAULT_QUEUE_CAPACITY};
use crate::engine::timing::{
    check_bpm, check_loop_length, check_loop_start, check_lpb, check_shuffle,
};

/// Default number of async work items.
pub const DEFAULT_ASYNC_POOL_SIZE: usize = 100;

/// Errors that can occur while reading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("File error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] EngineError),
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Invalid(inner) => inner,
            other => EngineError::SyscallFailure(other.to_string()),
        }
    }
}

/// Per-dimension signal shapes. `None` leaves a dimension unallocatable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub audio: Option<SignalDefaults>,
    pub grid: Option<SignalDefaults>,
    pub midi: Option<SignalDefaults>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            audio: SignalDefaults::builtin(Dimension::Audio),
            grid: SignalDefaults::builtin(Dimension::Grid),
            midi: SignalDefaults::builtin(Dimension::Midi),
        }
    }
}

impl SignalConfig {
    /// Validates every entry and returns the table indexed by dimension.
    pub fn table(&self) -> EngineResult<DefaultsTable> {
        let mut table: DefaultsTable = [None; Dimension::COUNT];
        for (dimension, defaults) in [
            (Dimension::Audio, self.audio),
            (Dimension::Grid, self.grid),
            (Dimension::Midi, self.midi),
        ] {
            if let Some(d) = defaults {
                d.validate(dimension)?;
            }
            table[dimension.index()] = defaults;
        }
        Ok(table)
    }
}

/// Initial sequencer settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    pub bpm: i32,
    pub lpb: i32,
    pub loop_start: i32,
    pub loop_length: i32,
    pub looping: bool,
    pub shuffle: i32,
}

impl Default for TempoConfig {
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

/// Everything needed to start an engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub signals: SignalConfig,
    pub tempo: TempoConfig,
    /// Capacity of the operation queue used in real-time mode.
    pub queue_capacity: usize,
    /// Operations executed per period at most.
    pub drain_limit: usize,
    pub async_pool_size: usize,
    pub event_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            signals: SignalConfig::default(),
            tempo: TempoConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drain_limit: DEFAULT_DRAIN_LIMIT,
            async_pool_size: DEFAULT_ASYNC_POOL_SIZE,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

impl EngineConfig {
    /// Checks ranges that would otherwise only fail when the engine starts.
    pub fn validate(&self) -> EngineResult<()> {
        self.signals.table()?;
        check_bpm(self.tempo.bpm)?;
        check_lpb(self.tempo.lpb)?;
        check_loop_start(self.tempo.loop_start)?;
        check_loop_length(self.tempo.loop_length)?;
        check_shuffle(self.tempo.shuffle)?;
        if self.queue_capacity == 0 || self.drain_limit == 0 || self.async_pool_size == 0 {
            return Err(EngineError::ResourceExhausted(
                "queue, drain and pool sizes must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Reads and validates a JSON configuration file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
