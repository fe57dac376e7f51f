//! Sequencer clock and transport state.
//!
//! [`EngineState`] converts tempo and lines-per-beat into per-dimension
//! samples-per-tick, advances the tick and line counters once per period,
//! applies loop wraparound and shuffle, and decides when periodic callbacks fire.
//! It is only mutated through the operation channel.

use std::sync::Arc;

use crate::dsp::context::TransportSnapshot;
use crate::dsp::signal::{DefaultsTable, Dimension};

use super::error::{EngineError, EngineResult};

/// Ticks in one sequencer line.
pub const TICKS_PER_LINE: i64 = 16;

/// Shuffle factors are expressed in hundredths.
pub const SHUFFLE_FACTOR_DIVISOR: i64 = 100;

/// Shortest accepted loop, in lines.
pub const MIN_LOOP_LENGTH: i32 = 4;

/// Largest accepted shuffle factor.
pub const MAX_SHUFFLE: i32 = 100;

/// A callback fired with the current line every `interval` lines.
pub type PeriodicCallback = Arc<dyn Fn(i32) + Send + Sync>;

/// What the sink should do with the period being pulled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeriodStart {
    /// Playback is stopped; output silence.
    Paused,
    /// Playback just restarted; output silence this period.
    Resumed,
    /// Render the chain.
    Render,
}

pub fn check_bpm(bpm: i32) -> EngineResult<()> {
    if (20..=200).contains(&bpm) {
        Ok(())
    } else {
        Err(EngineError::ParameterOutOfSpec {
            name: "bpm",
            value: bpm as i64,
        })
    }
}

pub fn check_lpb(lpb: i32) -> EngineResult<()> {
    if (2..=24).contains(&lpb) {
        Ok(())
    } else {
        Err(EngineError::ParameterOutOfSpec {
            name: "lpb",
            value: lpb as i64,
        })
    }
}

pub fn check_loop_start(line: i32) -> EngineResult<()> {
    if line >= 0 {
        Ok(())
    } else {
        Err(EngineError::ParameterOutOfSpec {
            name: "loop_start",
            value: line as i64,
        })
    }
}

pub fn check_loop_length(length: i32) -> EngineResult<()> {
    if length >= MIN_LOOP_LENGTH {
        Ok(())
    } else {
        Err(EngineError::ParameterOutOfSpec {
            name: "loop_length",
            value: length as i64,
        })
    }
}

pub fn check_shuffle(shuffle: i32) -> EngineResult<()> {
    if (0..=MAX_SHUFFLE).contains(&shuffle) {
        Ok(())
    } else {
        Err(EngineError::ParameterOutOfSpec {
            name: "shuffle",
            value: shuffle as i64,
        })
    }
}

/// Tempo, loop and transport state of the engine.
pub struct EngineState {
    bpm: i32,
    lpb: i32,
    loop_start: i32,
    loop_stop: i32,
    do_loop: bool,
    shuffle: i32,
    tick: i32,
    line: i32,
    next_tick_at: [i64; Dimension::COUNT],
    samples_per_tick: [i64; Dimension::COUNT],
    samples_per_tick_shuffle: [i64; Dimension::COUNT],
    playing: bool,
    was_playing: bool,
    recording: bool,
    record_filename: String,
    loading: bool,
    periodic: Vec<(PeriodicCallback, i32)>,
}

impl EngineState {
    /// Creates the state with validated initial values. Playback starts stopped.
    pub fn new(
        bpm: i32,
        lpb: i32,
        loop_start: i32,
        loop_length: i32,
        do_loop: bool,
        shuffle: i32,
    ) -> EngineResult<Self> {
        check_bpm(bpm)?;
        check_lpb(lpb)?;
        check_loop_start(loop_start)?;
        check_loop_length(loop_length)?;
        check_shuffle(shuffle)?;
        Ok(Self {
            bpm,
            lpb,
            loop_start,
            loop_stop: loop_start + loop_length,
            do_loop,
            shuffle,
            tick: 0,
            line: 0,
            next_tick_at: [0; Dimension::COUNT],
            samples_per_tick: [0; Dimension::COUNT],
            samples_per_tick_shuffle: [0; Dimension::COUNT],
            playing: false,
            was_playing: false,
            recording: false,
            record_filename: String::new(),
            loading: false,
            periodic: Vec::new(),
        })
    }

    pub fn bpm(&self) -> i32 {
        self.bpm
    }

    pub fn lpb(&self) -> i32 {
        self.lpb
    }

    pub fn loop_start(&self) -> i32 {
        self.loop_start
    }

    pub fn loop_length(&self) -> i32 {
        self.loop_stop - self.loop_start
    }

    pub fn is_looping(&self) -> bool {
        self.do_loop
    }

    pub fn shuffle(&self) -> i32 {
        self.shuffle
    }

    /// Tick within the current line.
    pub fn tick(&self) -> i32 {
        self.tick
    }

    /// The line the next tick belongs to.
    pub fn line(&self) -> i32 {
        self.line
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn record_filename(&self) -> &str {
        &self.record_filename
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn samples_per_tick(&self, dimension: Dimension) -> i64 {
        self.samples_per_tick[dimension.index()]
    }

    pub fn set_bpm(&mut self, bpm: i32) -> EngineResult<()> {
        check_bpm(bpm)?;
        self.bpm = bpm;
        Ok(())
    }

    pub fn set_lpb(&mut self, lpb: i32) -> EngineResult<()> {
        check_lpb(lpb)?;
        self.lpb = lpb;
        Ok(())
    }

    /// Moves the loop start. The loop stop line stays where it is.
    pub fn set_loop_start(&mut self, line: i32) -> EngineResult<()> {
        check_loop_start(line)?;
        self.loop_start = line;
        Ok(())
    }

    pub fn set_loop_length(&mut self, length: i32) -> EngineResult<()> {
        check_loop_length(length)?;
        self.loop_stop = self.loop_start + length;
        Ok(())
    }

    pub fn set_looping(&mut self, do_loop: bool) {
        self.do_loop = do_loop;
    }

    pub fn set_shuffle(&mut self, shuffle: i32) -> EngineResult<()> {
        check_shuffle(shuffle)?;
        self.shuffle = shuffle;
        Ok(())
    }

    pub fn play(&mut self) {
        self.playing = true;
    }

    pub fn stop(&mut self) {
        self.playing = false;
    }

    pub fn set_record(&mut self, recording: bool, filename: Option<String>) {
        self.recording = recording;
        if let Some(filename) = filename {
            self.record_filename = filename;
        }
    }

    /// Sets the loading flag. Returns true when loading just finished and
    /// listeners should hear about it.
    pub fn set_loading(&mut self, loading: bool) -> bool {
        self.loading = loading;
        !loading
    }

    /// Repositions the sequencer. Positions outside an active loop snap to its start.
    pub fn jump_to(&mut self, line: i32) {
        let mut line = line;
        if self.do_loop && (line < self.loop_start || line > self.loop_stop) {
            line = self.loop_start;
        }
        self.tick = 0;
        self.line = line;
    }

    /// Back to the loop start, or to line zero when not looping.
    pub fn rewind(&mut self) {
        self.line = if self.do_loop { self.loop_start } else { 0 };
        self.tick = 0;
    }

    /// Adds a periodic callback, or changes the interval of one already registered.
    pub fn register_periodic(&mut self, callback: PeriodicCallback, interval: i32) -> EngineResult<()> {
        if interval <= 0 {
            return Err(EngineError::ParameterOutOfSpec {
                name: "periodic_interval",
                value: interval as i64,
            });
        }
        self.periodic.retain(|(cb, _)| !Arc::ptr_eq(cb, &callback));
        self.periodic.push((callback, interval));
        Ok(())
    }

    pub fn unregister_periodic(&mut self, callback: &PeriodicCallback) {
        self.periodic.retain(|(cb, _)| !Arc::ptr_eq(cb, callback));
    }

    pub fn periodic_count(&self) -> usize {
        self.periodic.len()
    }

    /// Decides how the next period is pulled, tracking pause and resume edges.
    pub fn begin_period(&mut self) -> PeriodStart {
        if !self.playing {
            self.was_playing = false;
            return PeriodStart::Paused;
        }
        if !self.was_playing {
            self.was_playing = true;
            return PeriodStart::Resumed;
        }
        PeriodStart::Render
    }

    /// Recomputes samples per tick and the shuffle offset for every dimension.
    pub fn calculate_samples_per_tick(&mut self, defaults: &DefaultsTable) {
        for d in Dimension::ALL {
            let i = d.index();
            let spt = defaults[i].map_or(0, |def| {
                def.frequency as i64 * 60
                    / (self.bpm as i64 * self.lpb as i64 * TICKS_PER_LINE)
            });
            self.samples_per_tick[i] = spt;
            self.samples_per_tick_shuffle[i] =
                (self.shuffle as i64 * 3 * (spt >> 3)) / SHUFFLE_FACTOR_DIVISOR;
        }
    }

    /// Advances the clock past one period.
    ///
    /// Ticks and lines advance while walking the MIDI dimension; `fire` is called
    /// for each periodic callback whose interval divides the line on which a new
    /// line starts. Dimensions with no defaults or a zero tick length are skipped.
    pub fn advance<F>(&mut self, defaults: &DefaultsTable, mut fire: F)
    where
        F: FnMut(&PeriodicCallback, i32),
    {
        for d in Dimension::ALL {
            let i = d.index();
            let Some(def) = defaults[i] else {
                continue;
            };
            let spt = self.samples_per_tick[i];
            if spt <= 0 {
                continue;
            }
            let sptf = self.samples_per_tick_shuffle[i];
            let samples = def.samples as i64;
            let mut nta = self.next_tick_at[i];
            let mut even_line = self.line % 2 == 0;

            while nta < samples {
                if d == Dimension::Midi {
                    if self.tick == 0 {
                        for (callback, interval) in &self.periodic {
                            if self.line % interval == 0 {
                                fire(callback, self.line);
                            }
                        }
                    }
                    self.tick = (self.tick + 1) % TICKS_PER_LINE as i32;
                    if self.tick == 0 {
                        self.line += 1;
                        if self.do_loop && self.line >= self.loop_stop {
                            self.line = self.loop_start;
                        }
                        even_line = self.line % 2 == 0;
                    }
                }
                let step = if even_line { spt - sptf } else { spt + sptf };
                nta += step.max(1);
            }
            self.next_tick_at[i] = nta - samples;
        }
    }

    /// Copies the transport fields plugins may read.
    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            playing: self.playing,
            recording: self.recording,
            bpm: self.bpm as u32,
            lpb: self.lpb as u32,
            tick: self.tick as u32,
            line: self.line,
            next_tick_at: self.next_tick_at,
            samples_per_tick: self.samples_per_tick,
            samples_per_tick_shuffle: self.samples_per_tick_shuffle,
        }
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            bpm: 120,
            lpb: 4,
            loop_start: 0,
            loop_stop: 64,
            do_loop: true,
            shuffle: 0,
            tick: 0,
            line: 0,
            next_tick_at: [0; Dimension::COUNT],
            samples_per_tick: [0; Dimension::COUNT],
            samples_per_tick_shuffle: [0; Dimension::COUNT],
            playing: false,
            was_playing: false,
            recording: false,
            record_filename: String::new(),
            loading: false,
            periodic: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::signal::{builtin_defaults, Resolution, SignalDefaults};
    use crate::engine::ErrorKind;
    use parking_lot::Mutex;

    fn run_periods(state: &mut EngineState, periods: usize) {
        let defaults = builtin_defaults();
        state.calculate_samples_per_tick(&defaults);
        for _ in 0..periods {
            state.advance(&defaults, |_, _| {});
        }
    }

    #[test]
    fn test_defaults() {
        let state = EngineState::default();
        assert_eq!(state.bpm(), 120);
        assert_eq!(state.lpb(), 4);
        assert_eq!(state.loop_start(), 0);
        assert_eq!(state.loop_length(), 64);
        assert!(state.is_looping());
        assert!(!state.is_playing());
    }

    #[test]
    fn test_parameter_ranges() {
        let mut state = EngineState::default();
        assert_eq!(state.set_bpm(19).unwrap_err().kind(), ErrorKind::ParameterOutOfSpec);
        assert!(state.set_bpm(201).is_err());
        assert!(state.set_bpm(200).is_ok());
        assert!(state.set_lpb(1).is_err());
        assert!(state.set_lpb(25).is_err());
        assert!(state.set_lpb(24).is_ok());
        assert!(state.set_loop_start(-1).is_err());
        assert!(state.set_loop_length(3).is_err());
        assert!(EngineState::new(120, 4, 0, 2, true, 0).is_err());
    }

    #[test]
    fn test_samples_per_tick() {
        let mut state = EngineState::default();
        state.set_shuffle(50).unwrap();
        state.calculate_samples_per_tick(&builtin_defaults());
        // 44100 * 60 / (120 * 4 * 16)
        assert_eq!(state.samples_per_tick(Dimension::Audio), 344);
        assert_eq!(state.samples_per_tick(Dimension::Grid), 0);
        assert_eq!(state.samples_per_tick(Dimension::Vector), 0);
        let snapshot = state.snapshot();
        // (50 * 3 * (344 >> 3)) / 100
        assert_eq!(snapshot.samples_per_tick_shuffle[0], 64);
    }

    #[test]
    fn test_line_advances_after_sixteen_ticks() {
        let mut state = EngineState::default();
        // One line at 120 bpm / 4 lpb is 16 * 344 = 5504 samples; 1024 per period.
        run_periods(&mut state, 5);
        assert_eq!(state.line(), 0);
        run_periods(&mut state, 1);
        assert_eq!(state.line(), 1);
    }

    #[test]
    fn test_loop_wraps_to_start() {
        let mut state = EngineState::default();
        state.set_loop_start(4).unwrap();
        state.set_loop_length(4).unwrap();
        state.rewind();
        assert_eq!(state.line(), 4);
        for _ in 0..200 {
            run_periods(&mut state, 1);
            assert!((4..8).contains(&state.line()), "line {}", state.line());
        }
    }

    #[test]
    fn test_jump_to_snaps_into_loop() {
        let mut state = EngineState::default();
        state.set_loop_start(8).unwrap();
        state.set_loop_length(8).unwrap();
        state.jump_to(2);
        assert_eq!(state.line(), 8);
        state.jump_to(12);
        assert_eq!(state.line(), 12);
        state.jump_to(40);
        assert_eq!(state.line(), 8);

        state.set_looping(false);
        state.jump_to(40);
        assert_eq!(state.line(), 40);
        state.rewind();
        assert_eq!(state.line(), 0);
        assert_eq!(state.tick(), 0);
    }

    #[test]
    fn test_periodic_callbacks_fire_on_interval() {
        let mut state = EngineState::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let callback: PeriodicCallback = Arc::new(move |line| s.lock().push(line));
        state.register_periodic(Arc::clone(&callback), 2).unwrap();
        state.register_periodic(Arc::clone(&callback), 4).unwrap();
        assert_eq!(state.periodic_count(), 1);
        assert!(state.register_periodic(Arc::clone(&callback), 0).is_err());

        let defaults = builtin_defaults();
        state.calculate_samples_per_tick(&defaults);
        for _ in 0..60 {
            state.advance(&defaults, |cb, line| cb(line));
        }
        let lines = seen.lock().clone();
        assert!(!lines.is_empty());
        assert!(lines.iter().all(|l| l % 4 == 0));
        assert_eq!(lines[0], 0);

        state.unregister_periodic(&callback);
        assert_eq!(state.periodic_count(), 0);
    }

    #[test]
    fn test_pause_and_resume_edges() {
        let mut state = EngineState::default();
        assert_eq!(state.begin_period(), PeriodStart::Paused);
        assert_eq!(state.begin_period(), PeriodStart::Paused);
        state.play();
        assert_eq!(state.begin_period(), PeriodStart::Resumed);
        assert_eq!(state.begin_period(), PeriodStart::Render);
        state.stop();
        assert_eq!(state.begin_period(), PeriodStart::Paused);
    }

    #[test]
    fn test_shuffle_keeps_average_tempo() {
        let mut state = EngineState::default();
        state.set_shuffle(100).unwrap();
        state.calculate_samples_per_tick(&builtin_defaults());
        let snapshot = state.snapshot();
        let even = snapshot.tick_length(0, 0);
        let odd = snapshot.tick_length(0, 1);
        assert_ne!(even, odd);
        assert_eq!(even + odd, 2 * 344);
    }

    #[test]
    fn test_shuffle_range() {
        let mut state = EngineState::default();
        assert_eq!(state.set_shuffle(-1).unwrap_err().kind(), ErrorKind::ParameterOutOfSpec);
        assert_eq!(state.set_shuffle(101).unwrap_err().kind(), ErrorKind::ParameterOutOfSpec);
        assert_eq!(state.shuffle(), 0);
        assert!(state.set_shuffle(MAX_SHUFFLE).is_ok());
        assert!(EngineState::new(120, 4, 0, 16, true, 300).is_err());
    }

    #[test]
    fn test_full_shuffle_on_short_ticks_still_advances() {
        let mut defaults = builtin_defaults();
        // 12800 * 60 / (200 * 24 * 16) = 10 samples per tick.
        defaults[Dimension::Midi.index()] =
            Some(SignalDefaults::new(1024, Resolution::Pointer, 12800));
        let mut state = EngineState::new(200, 24, 0, 64, true, MAX_SHUFFLE).unwrap();
        state.calculate_samples_per_tick(&defaults);
        assert_eq!(state.samples_per_tick(Dimension::Midi), 10);
        for _ in 0..8 {
            state.advance(&defaults, |_, _| {});
        }
        // 8 periods of 1024 samples at an average of 10 samples per tick.
        assert_eq!(state.line(), 8192 / 10 / 16);
    }

    #[test]
    fn test_loading_flag() {
        let mut state = EngineState::default();
        assert!(!state.set_loading(true));
        assert!(state.is_loading());
        assert!(state.set_loading(false));
    }
}
