//! Transport information handed to plugins during execution.
//!
//! A read-only snapshot of the sequencer, taken once per period before the
//! render chain is walked.

/// Transport state for synchronization.
///
/// Lets plugins that sequence events (trackers, arpeggiators, tempo-synced
/// effects) align to the engine's tick grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportSnapshot {
    /// Whether playback is currently active.
    pub playing: bool,
    /// Whether the sink is recording.
    pub recording: bool,
    /// Tempo in beats per minute.
    pub bpm: u32,
    /// Lines per beat.
    pub lpb: u32,
    /// Current tick within the line.
    pub tick: u32,
    /// Sequencer line that the next tick belongs to.
    pub line: i32,
    /// Samples until the next tick, per dimension index.
    pub next_tick_at: [i64; 4],
    /// Samples per tick, per dimension index.
    pub samples_per_tick: [i64; 4],
    /// Shuffle offset in samples, per dimension index.
    pub samples_per_tick_shuffle: [i64; 4],
}

impl TransportSnapshot {
    /// Samples per tick for the given dimension index, adjusted for the shuffle
    /// of the line the tick belongs to.
    pub fn tick_length(&self, dimension: usize, line: i32) -> i64 {
        let spt = self.samples_per_tick[dimension];
        let shuffle = self.samples_per_tick_shuffle[dimension];
        if line % 2 == 0 {
            spt - shuffle
        } else {
            spt + shuffle
        }
    }

    /// Duration of one beat in samples at `sample_rate`.
    pub fn samples_per_beat(&self, sample_rate: u32) -> Option<f32> {
        if self.bpm == 0 {
            None
        } else {
            Some(sample_rate as f32 * 60.0 / self.bpm as f32)
        }
    }
}
