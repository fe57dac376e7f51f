//! Sample data loaded from files and referenced by `SignalId` controllers.

use serde::{Deserialize, Serialize};

use crate::dsp::controller::MAX_SIGNAL_ID;
use crate::dsp::signal::{Dimension, Resolution};

use super::error::{EngineError, EngineResult};

/// Number of static signal slots.
pub const STATIC_SIGNAL_SLOTS: usize = MAX_SIGNAL_ID as usize + 1;

/// One loaded sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StaticSignal {
    pub name: String,
    pub path: String,
    pub dimension: Dimension,
    pub resolution: Resolution,
    pub channels: usize,
    pub frequency: u32,
    /// Interleaved samples.
    pub samples: Vec<f32>,
}

impl StaticSignal {
    /// Frames per channel.
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }
}

/// The fixed table of static signal slots.
#[derive(Clone, Debug)]
pub struct StaticSignalTable {
    slots: Vec<Option<StaticSignal>>,
}

impl StaticSignalTable {
    pub fn new() -> Self {
        Self {
            slots: vec![None; STATIC_SIGNAL_SLOTS],
        }
    }

    fn check(index: i32) -> EngineResult<usize> {
        usize::try_from(index)
            .ok()
            .filter(|i| *i < STATIC_SIGNAL_SLOTS)
            .ok_or_else(|| EngineError::sanity(format!("static signal index {} out of range", index)))
    }

    /// Stores `signal` in a slot, returning what it replaced.
    pub fn set(&mut self, index: i32, signal: StaticSignal) -> EngineResult<Option<StaticSignal>> {
        let i = Self::check(index)?;
        Ok(self.slots[i].replace(signal))
    }

    pub fn clear(&mut self, index: i32) -> EngineResult<Option<StaticSignal>> {
        let i = Self::check(index)?;
        Ok(self.slots[i].take())
    }

    pub fn get(&self, index: i32) -> Option<&StaticSignal> {
        Self::check(index).ok().and_then(|i| self.slots[i].as_ref())
    }

    /// Occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &StaticSignal)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i as i32, s)))
    }

    pub fn clear_all(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

impl Default for StaticSignalTable {
    fn default() -> Self {
        Self::new()
    }
}
