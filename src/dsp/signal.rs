//! Signal dimensions, sample encodings and buffers.
//!
//! A [`SignalBuffer`] is the storage behind one graph signal. Its shape comes
//! from the process-wide [`SignalDefaults`] of its dimension, and it is
//! reallocated in place whenever those defaults change.

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};

/// The dimension of a signal.
///
/// - **Audio**: a block of samples per channel (0D per sample)
/// - **Vector**: one-dimensional values per sample (not allocatable)
/// - **Grid**: a parameter grid updated at a low rate
/// - **Midi**: per-sample lists of MIDI events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Audio,
    Vector,
    Grid,
    Midi,
}

impl Dimension {
    /// Number of dimensions.
    pub const COUNT: usize = 4;

    /// All dimensions in index order.
    pub const ALL: [Dimension; Self::COUNT] = [
        Dimension::Audio,
        Dimension::Vector,
        Dimension::Grid,
        Dimension::Midi,
    ];

    /// Index into per-dimension tables.
    pub fn index(self) -> usize {
        match self {
            Dimension::Audio => 0,
            Dimension::Vector => 1,
            Dimension::Grid => 2,
            Dimension::Midi => 3,
        }
    }

    /// Returns a human-readable name for the dimension.
    pub fn name(&self) -> &'static str {
        match self {
            Dimension::Audio => "Audio",
            Dimension::Vector => "Vector",
            Dimension::Grid => "Grid",
            Dimension::Midi => "MIDI",
        }
    }
}

/// Sample encoding of a signal buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    Int8,
    Int16,
    Int32,
    Float32,
    /// Signed fixed point with 24 fractional bits.
    Fixed8p24,
    /// Per-sample event lists, used by MIDI signals.
    Pointer,
}

/// Shape shared by every signal of one dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDefaults {
    /// Samples per period.
    pub samples: usize,
    /// Sample encoding.
    pub resolution: Resolution,
    /// Sample rate in Hz.
    pub frequency: u32,
}

impl SignalDefaults {
    /// Creates a new set of defaults.
    pub fn new(samples: usize, resolution: Resolution, frequency: u32) -> Self {
        Self {
            samples,
            resolution,
            frequency,
        }
    }

    /// Built-in defaults for a dimension; `None` for dimensions that cannot be allocated.
    pub fn builtin(dimension: Dimension) -> Option<Self> {
        match dimension {
            Dimension::Audio => Some(Self::new(1024, Resolution::Float32, 44100)),
            Dimension::Grid => Some(Self::new(12, Resolution::Float32, 24)),
            Dimension::Midi => Some(Self::new(1024, Resolution::Pointer, 44100)),
            Dimension::Vector => None,
        }
    }

    /// Checks that the resolution can be used for a dimension.
    pub fn validate(&self, dimension: Dimension) -> EngineResult<()> {
        match (dimension, self.resolution) {
            (Dimension::Vector, _) => Err(EngineError::sanity("Unsupported dimension.")),
            (Dimension::Midi, Resolution::Pointer) => Ok(()),
            (Dimension::Midi, _) => Err(EngineError::sanity(
                "Unsupported resolution for MIDI signal.",
            )),
            (_, Resolution::Pointer) => Err(EngineError::sanity(
                "Unsupported resolution for sample signal.",
            )),
            _ => Ok(()),
        }
    }
}

/// Per-dimension defaults, indexed by [`Dimension::index`]. `None` marks a
/// dimension that cannot be allocated.
pub type DefaultsTable = [Option<SignalDefaults>; Dimension::COUNT];

/// The built-in defaults for every dimension.
pub fn builtin_defaults() -> DefaultsTable {
    Dimension::ALL.map(SignalDefaults::builtin)
}

/// A MIDI message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note On: (note number 0-127, velocity 0-127)
    NoteOn { note: u8, velocity: u8 },
    /// Note Off: (note number 0-127, velocity 0-127)
    NoteOff { note: u8, velocity: u8 },
    /// Control Change: (controller number 0-127, value 0-127)
    ControlChange { controller: u8, value: u8 },
    /// Pitch Bend: (-8192 to 8191, centered at 0)
    PitchBend { value: i16 },
    /// Channel Aftertouch: (pressure 0-127)
    Aftertouch { pressure: u8 },
    /// Program Change: (program number 0-127)
    ProgramChange { program: u8 },
}

impl MidiMessage {
    /// Parses a raw channel message into (channel, message).
    ///
    /// Note On with velocity 0 is reported as Note Off.
    pub fn parse(bytes: &[u8]) -> Option<(u8, MidiMessage)> {
        let status = *bytes.first()?;
        let channel = status & 0x0f;
        let data1 = bytes.get(1).copied().unwrap_or(0) & 0x7f;
        let data2 = bytes.get(2).copied().unwrap_or(0) & 0x7f;
        let message = match status & 0xf0 {
            0x80 => MidiMessage::NoteOff {
                note: data1,
                velocity: data2,
            },
            0x90 if data2 == 0 => MidiMessage::NoteOff {
                note: data1,
                velocity: 0,
            },
            0x90 => MidiMessage::NoteOn {
                note: data1,
                velocity: data2,
            },
            0xb0 => MidiMessage::ControlChange {
                controller: data1,
                value: data2,
            },
            0xc0 => MidiMessage::ProgramChange { program: data1 },
            0xd0 => MidiMessage::Aftertouch { pressure: data1 },
            0xe0 => MidiMessage::PitchBend {
                value: (((data2 as i16) << 7) | data1 as i16) - 8192,
            },
            _ => return None,
        };
        Some((channel, message))
    }

    /// Converts a note number to frequency in Hz (A4 = 440 Hz).
    pub fn note_to_frequency(note: u8) -> f32 {
        440.0 * 2.0_f32.powf((note as f32 - 69.0) / 12.0)
    }
}

/// Backing storage of a signal, one variant per [`Resolution`].
#[derive(Clone, Debug, PartialEq)]
pub enum SampleData {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Float32(Vec<f32>),
    Fixed8p24(Vec<i32>),
    Events(Vec<Vec<MidiMessage>>),
}

/// Events pre-reserved per MIDI slot so that typical writes do not allocate.
const EVENT_SLOT_CAPACITY: usize = 4;

impl SampleData {
    fn allocate(resolution: Resolution, len: usize) -> Self {
        match resolution {
            Resolution::Int8 => SampleData::Int8(vec![0; len]),
            Resolution::Int16 => SampleData::Int16(vec![0; len]),
            Resolution::Int32 => SampleData::Int32(vec![0; len]),
            Resolution::Float32 => SampleData::Float32(vec![0.0; len]),
            Resolution::Fixed8p24 => SampleData::Fixed8p24(vec![0; len]),
            Resolution::Pointer => SampleData::Events(
                (0..len)
                    .map(|_| Vec::with_capacity(EVENT_SLOT_CAPACITY))
                    .collect(),
            ),
        }
    }

    fn len(&self) -> usize {
        match self {
            SampleData::Int8(v) => v.len(),
            SampleData::Int16(v) => v.len(),
            SampleData::Int32(v) | SampleData::Fixed8p24(v) => v.len(),
            SampleData::Float32(v) => v.len(),
            SampleData::Events(v) => v.len(),
        }
    }
}

/// A buffer holding one period of an interleaved signal.
///
/// Sample `i` of channel `c` lives at `i * channels + c`.
#[derive(Clone, Debug, PartialEq)]
pub struct SignalBuffer {
    dimension: Dimension,
    channels: usize,
    defaults: SignalDefaults,
    data: SampleData,
}

impl SignalBuffer {
    /// Allocates a zeroed buffer shaped by `defaults`.
    pub fn allocate(
        dimension: Dimension,
        channels: usize,
        defaults: SignalDefaults,
    ) -> EngineResult<Self> {
        defaults.validate(dimension)?;
        let len = channels
            .checked_mul(defaults.samples)
            .ok_or_else(|| EngineError::ResourceExhausted("signal buffer too large".into()))?;
        Ok(Self {
            dimension,
            channels,
            defaults,
            data: SampleData::allocate(defaults.resolution, len),
        })
    }

    /// An empty placeholder that owns no heap memory.
    ///
    /// Used to move a buffer out of shared storage for the duration of a call.
    pub fn detached() -> Self {
        Self {
            dimension: Dimension::Audio,
            channels: 0,
            defaults: SignalDefaults::new(0, Resolution::Float32, 0),
            data: SampleData::Float32(Vec::new()),
        }
    }

    /// Reshapes the buffer to new defaults, reusing storage where possible, and clears it.
    pub fn reallocate(&mut self, defaults: SignalDefaults) -> EngineResult<()> {
        defaults.validate(self.dimension)?;
        let len = self
            .channels
            .checked_mul(defaults.samples)
            .ok_or_else(|| EngineError::ResourceExhausted("signal buffer too large".into()))?;

        match (&mut self.data, defaults.resolution) {
            (SampleData::Int8(v), Resolution::Int8) => v.resize(len, 0),
            (SampleData::Int16(v), Resolution::Int16) => v.resize(len, 0),
            (SampleData::Int32(v), Resolution::Int32) => v.resize(len, 0),
            (SampleData::Float32(v), Resolution::Float32) => v.resize(len, 0.0),
            (SampleData::Fixed8p24(v), Resolution::Fixed8p24) => v.resize(len, 0),
            (SampleData::Events(v), Resolution::Pointer) => {
                v.resize_with(len, || Vec::with_capacity(EVENT_SLOT_CAPACITY))
            }
            (data, resolution) => *data = SampleData::allocate(resolution, len),
        }
        self.defaults = defaults;
        self.clear();
        Ok(())
    }

    /// Clears the buffer, setting all samples to zero and dropping all events.
    pub fn clear(&mut self) {
        match &mut self.data {
            SampleData::Int8(v) => v.fill(0),
            SampleData::Int16(v) => v.fill(0),
            SampleData::Int32(v) | SampleData::Fixed8p24(v) => v.fill(0),
            SampleData::Float32(v) => v.fill(0.0),
            SampleData::Events(v) => v.iter_mut().for_each(Vec::clear),
        }
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    pub fn resolution(&self) -> Resolution {
        self.defaults.resolution
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Samples per channel in one period.
    pub fn samples(&self) -> usize {
        self.defaults.samples
    }

    pub fn frequency(&self) -> u32 {
        self.defaults.frequency
    }

    /// Total number of interleaved slots.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    pub fn data(&self) -> &SampleData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut SampleData {
        &mut self.data
    }

    /// Float samples, if this buffer uses the `Float32` resolution.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            SampleData::Float32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            SampleData::Float32(v) => Some(v),
            _ => None,
        }
    }

    /// Event slots, if this is a MIDI buffer.
    pub fn events(&self) -> Option<&[Vec<MidiMessage>]> {
        match &self.data {
            SampleData::Events(v) => Some(v),
            _ => None,
        }
    }

    pub fn events_mut(&mut self) -> Option<&mut [Vec<MidiMessage>]> {
        match &mut self.data {
            SampleData::Events(v) => Some(v),
            _ => None,
        }
    }

    /// Adds `source` into this buffer.
    ///
    /// Channels beyond the source's count reuse its last channel, so a mono
    /// source is duplicated into every channel. Event buffers are not mixed.
    pub fn mix_from(&mut self, source: &SignalBuffer) {
        let out_channels = self.channels;
        let in_channels = source.channels;
        if out_channels == 0 || in_channels == 0 {
            return;
        }
        let frames = self.samples().min(source.samples());

        macro_rules! mix {
            ($out:expr, $inp:expr, $add:expr) => {
                for i in 0..frames {
                    for c in 0..out_channels {
                        let c_in = c.min(in_channels - 1);
                        let o = &mut $out[i * out_channels + c];
                        *o = $add(*o, $inp[i * in_channels + c_in]);
                    }
                }
            };
        }

        match (&mut self.data, &source.data) {
            (SampleData::Int8(o), SampleData::Int8(s)) => mix!(o, s, i8::saturating_add),
            (SampleData::Int16(o), SampleData::Int16(s)) => mix!(o, s, i16::saturating_add),
            (SampleData::Int32(o), SampleData::Int32(s)) => mix!(o, s, i32::saturating_add),
            (SampleData::Fixed8p24(o), SampleData::Fixed8p24(s)) => {
                mix!(o, s, i32::saturating_add)
            }
            (SampleData::Float32(o), SampleData::Float32(s)) => mix!(o, s, |a: f32, b: f32| a + b),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_defaults(samples: usize) -> SignalDefaults {
        SignalDefaults::new(samples, Resolution::Float32, 48000)
    }

    #[test]
    fn test_builtin_defaults() {
        let audio = SignalDefaults::builtin(Dimension::Audio).unwrap();
        assert_eq!(audio.samples, 1024);
        assert_eq!(audio.frequency, 44100);
        assert_eq!(
            SignalDefaults::builtin(Dimension::Midi).unwrap().resolution,
            Resolution::Pointer
        );
        assert!(SignalDefaults::builtin(Dimension::Vector).is_none());
    }

    #[test]
    fn test_allocate_interleaved() {
        let buffer = SignalBuffer::allocate(Dimension::Audio, 2, audio_defaults(64)).unwrap();
        assert_eq!(buffer.len(), 128);
        assert_eq!(buffer.samples(), 64);
        assert!(buffer.as_f32().unwrap().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_unsupported_shapes_rejected() {
        assert!(SignalBuffer::allocate(Dimension::Vector, 1, audio_defaults(8)).is_err());
        assert!(SignalBuffer::allocate(Dimension::Midi, 1, audio_defaults(8)).is_err());
        let pointer = SignalDefaults::new(8, Resolution::Pointer, 44100);
        assert!(SignalBuffer::allocate(Dimension::Audio, 1, pointer).is_err());
        assert!(SignalBuffer::allocate(Dimension::Midi, 1, pointer).is_ok());
    }

    #[test]
    fn test_reallocate_changes_shape_and_clears() {
        let mut buffer = SignalBuffer::allocate(Dimension::Audio, 1, audio_defaults(4)).unwrap();
        buffer.as_f32_mut().unwrap().fill(0.5);

        buffer.reallocate(audio_defaults(16)).unwrap();
        assert_eq!(buffer.len(), 16);
        assert!(buffer.as_f32().unwrap().iter().all(|&s| s == 0.0));

        let fixed = SignalDefaults::new(8, Resolution::Fixed8p24, 22050);
        buffer.reallocate(fixed).unwrap();
        assert_eq!(buffer.resolution(), Resolution::Fixed8p24);
        assert_eq!(buffer.frequency(), 22050);
        assert!(matches!(buffer.data(), SampleData::Fixed8p24(v) if v.len() == 8));
    }

    #[test]
    fn test_mix_duplicates_mono_source() {
        let mut stereo = SignalBuffer::allocate(Dimension::Audio, 2, audio_defaults(3)).unwrap();
        let mut mono = SignalBuffer::allocate(Dimension::Audio, 1, audio_defaults(3)).unwrap();
        mono.as_f32_mut().unwrap().copy_from_slice(&[0.1, 0.2, 0.3]);

        stereo.mix_from(&mono);
        stereo.mix_from(&mono);

        let out = stereo.as_f32().unwrap();
        assert!((out[0] - 0.2).abs() < 1e-6);
        assert!((out[1] - 0.2).abs() < 1e-6);
        assert!((out[4] - 0.6).abs() < 1e-6);
        assert!((out[5] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_clear_events_keeps_slots() {
        let defaults = SignalDefaults::new(4, Resolution::Pointer, 44100);
        let mut midi = SignalBuffer::allocate(Dimension::Midi, 1, defaults).unwrap();
        midi.events_mut().unwrap()[2].push(MidiMessage::NoteOn {
            note: 60,
            velocity: 100,
        });
        midi.clear();
        assert_eq!(midi.events().unwrap().len(), 4);
        assert!(midi.events().unwrap().iter().all(Vec::is_empty));
    }

    #[test]
    fn test_parse_midi_messages() {
        assert_eq!(
            MidiMessage::parse(&[0x91, 60, 100]),
            Some((
                1,
                MidiMessage::NoteOn {
                    note: 60,
                    velocity: 100
                }
            ))
        );
        assert_eq!(
            MidiMessage::parse(&[0x90, 60, 0]),
            Some((
                0,
                MidiMessage::NoteOff {
                    note: 60,
                    velocity: 0
                }
            ))
        );
        assert_eq!(
            MidiMessage::parse(&[0xb3, 7, 127]),
            Some((
                3,
                MidiMessage::ControlChange {
                    controller: 7,
                    value: 127
                }
            ))
        );
        assert_eq!(
            MidiMessage::parse(&[0xe0, 0, 64]),
            Some((0, MidiMessage::PitchBend { value: 0 }))
        );
        assert_eq!(MidiMessage::parse(&[0xf8]), None);
        assert_eq!(MidiMessage::parse(&[]), None);
    }

    #[test]
    fn test_midi_note_to_frequency() {
        assert!((MidiMessage::note_to_frequency(69) - 440.0).abs() < 0.001);
        assert!((MidiMessage::note_to_frequency(57) - 220.0).abs() < 0.001);
    }
}
