//! Audio back-end
//!
//! Drives the engine from a cpal output stream. The stream callback pulls
//! periods through [`HostHandle::fill_sink`], chunking the device buffer into
//! periods of the configured block length, and binds itself as the real-time
//! thread on its first call.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleRate, Stream, StreamConfig, SupportedBufferSize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::dsp::signal::{Dimension, Resolution, SignalDefaults};

use super::error::EngineError;
use super::facade::Engine;
use super::handle::HostHandle;
use super::space::SinkStatus;

/// Block length used when the device does not report a range.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Errors that can occur during audio back-end operation.
#[derive(Debug, Clone, Error)]
pub enum AudioError {
    #[error("No audio output device found")]
    NoOutputDevice,
    #[error("Failed to get device configuration: {0}")]
    ConfigurationFailed(String),
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Failed to control audio playback: {0}")]
    StreamPlaybackFailed(String),
    #[error("No sink registered")]
    NoSink,
}

impl From<AudioError> for EngineError {
    fn from(err: AudioError) -> Self {
        EngineError::SyscallFailure(err.to_string())
    }
}

/// Information about an audio output device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    /// Index in the device list (for selection).
    pub index: usize,
}

/// Splits device buffers into engine periods.
///
/// Owned by the stream callback. `period` holds one rendered period and `pos`
/// is the first sample not yet handed to the device.
pub(crate) struct PeriodFeeder {
    host: HostHandle,
    sink: String,
    channels: usize,
    period: Vec<f32>,
    pos: usize,
    realtime: bool,
    warned: bool,
}

impl PeriodFeeder {
    pub(crate) fn new(host: HostHandle, sink: String, frames: usize, channels: usize) -> Self {
        let len = frames.max(1) * channels.max(1);
        Self {
            host,
            sink,
            channels: channels.max(1),
            period: vec![0.0; len],
            pos: len,
            realtime: false,
            warned: false,
        }
    }

    /// Fills one device buffer.
    pub(crate) fn fill(&mut self, data: &mut [f32]) {
        if !self.realtime {
            match self.host.enter_realtime() {
                Ok(()) => {
                    self.realtime = true;
                    info!(sink = %self.sink, "audio thread bound");
                }
                Err(err) => {
                    if !self.warned {
                        warn!(error = %err, "could not enter low latency mode");
                        self.warned = true;
                    }
                    data.fill(0.0);
                    return;
                }
            }
        }

        let mut written = 0;
        while written < data.len() {
            if self.pos == self.period.len() {
                self.render();
            }
            let n = (data.len() - written).min(self.period.len() - self.pos);
            data[written..written + n].copy_from_slice(&self.period[self.pos..self.pos + n]);
            written += n;
            self.pos += n;
        }
    }

    fn render(&mut self) {
        match self.host.fill_sink(&self.sink, &mut self.period, self.channels) {
            Ok(SinkStatus::NotASink) => {
                if !self.warned {
                    warn!(sink = %self.sink, "stream is not driving the registered sink");
                    self.warned = true;
                }
            }
            Ok(_) => {}
            Err(err) => {
                self.period.fill(0.0);
                if !self.warned {
                    error!(error = %err, "period pull failed");
                    self.warned = true;
                }
            }
        }
        self.pos = 0;
    }
}

/// Output device selection and the running stream.
pub struct AudioBackend {
    host: Host,
    device: Device,
    config: StreamConfig,
    block_size: usize,
    stream: Option<Stream>,
    engine_host: Option<HostHandle>,
}

impl AudioBackend {
    /// Opens the default output device.
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;
        let (config, block_size) = Self::device_config(&device)?;
        Ok(Self {
            host,
            device,
            config,
            block_size,
            stream: None,
            engine_host: None,
        })
    }

    fn device_config(device: &Device) -> Result<(StreamConfig, usize), AudioError> {
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::ConfigurationFailed(e.to_string()))?;
        let block_size = match supported.buffer_size() {
            SupportedBufferSize::Range { min, max } => {
                DEFAULT_BLOCK_SIZE.clamp(*min as usize, *max as usize)
            }
            SupportedBufferSize::Unknown => DEFAULT_BLOCK_SIZE,
        };
        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: SampleRate(supported.sample_rate().0),
            buffer_size: cpal::BufferSize::Default,
        };
        Ok((config, block_size))
    }

    pub fn enumerate_devices(&self) -> Vec<DeviceInfo> {
        let default_name = self
            .host
            .default_output_device()
            .and_then(|d| d.name().ok());

        self.host
            .output_devices()
            .map(|devices| {
                devices
                    .enumerate()
                    .filter_map(|(index, device)| {
                        device.name().ok().map(|name| DeviceInfo {
                            is_default: Some(&name) == default_name.as_ref(),
                            name,
                            index,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn current_device_name(&self) -> String {
        self.device.name().unwrap_or_else(|_| "Unknown".to_string())
    }

    /// Selects an output device by index. A running stream is stopped first.
    pub fn select_device(&mut self, index: usize) -> Result<(), AudioError> {
        self.stop()?;
        let device = self
            .host
            .output_devices()
            .map_err(|e| AudioError::ConfigurationFailed(e.to_string()))?
            .nth(index)
            .ok_or(AudioError::NoOutputDevice)?;
        let (config, block_size) = Self::device_config(&device)?;
        self.device = device;
        self.config = config;
        self.block_size = block_size;
        info!(device = %self.current_device_name(), "audio device selected");
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    pub fn channels(&self) -> u16 {
        self.config.channels
    }

    /// Block length the device prefers.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Audio signal defaults matching the selected device.
    pub fn preferred_defaults(&self) -> SignalDefaults {
        SignalDefaults::new(self.block_size, Resolution::Float32, self.sample_rate())
    }

    /// Starts a stream driving the engine's registered sink.
    pub fn start(&mut self, engine: &Engine) -> Result<(), AudioError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let sink = engine
            .sink_name()
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?
            .ok_or(AudioError::NoSink)?;
        let frames = engine
            .signal_defaults()
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?[Dimension::Audio.index()]
        .map_or(DEFAULT_BLOCK_SIZE, |d| d.samples);

        let host = engine.host();
        let mut feeder = PeriodFeeder::new(host.clone(), sink, frames, self.channels() as usize);
        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| feeder.fill(data),
                move |err| error!(error = %err, "audio stream error"),
                None,
            )
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;
        stream
            .play()
            .map_err(|e| AudioError::StreamPlaybackFailed(e.to_string()))?;

        info!(
            device = %self.current_device_name(),
            rate = self.sample_rate(),
            channels = self.channels(),
            frames,
            "audio stream started"
        );
        self.stream = Some(stream);
        self.engine_host = Some(host);
        Ok(())
    }

    /// Stops the stream and returns the engine to normal mode.
    pub fn stop(&mut self) -> Result<(), AudioError> {
        if let Some(stream) = self.stream.take() {
            stream
                .pause()
                .map_err(|e| AudioError::StreamPlaybackFailed(e.to_string()))?;
            drop(stream);
            info!("audio stream stopped");
        }
        if let Some(host) = self.engine_host.take() {
            if let Err(err) = host.leave_realtime() {
                warn!(error = %err, "failed to leave low latency mode");
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for AudioBackend {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "failed to stop audio stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::dsp::registry::PluginRegistry;
    use crate::engine::operations::Mode;
    use crate::engine::ErrorKind;
    use crate::machines::register_builtin;
    use std::sync::Arc;

    fn engine(frames: usize) -> Engine {
        let mut registry = PluginRegistry::new();
        register_builtin(&mut registry).unwrap();
        let mut config = EngineConfig::default();
        config.signals.audio = Some(SignalDefaults::new(frames, Resolution::Float32, 44100));
        Engine::with_fatal_handler(&config, registry, Arc::new(|err: &EngineError| panic!("fatal: {}", err)))
            .unwrap()
    }

    #[test]
    fn test_audio_error_display() {
        assert_eq!(AudioError::NoOutputDevice.to_string(), "No audio output device found");
        let err = AudioError::StreamCreationFailed("test error".to_string());
        assert!(err.to_string().contains("test error"));
        assert_eq!(EngineError::from(err).kind(), ErrorKind::SyscallFailure);
    }

    #[test]
    fn test_feeder_without_sink_outputs_silence() {
        let engine = engine(16);
        let mut feeder = PeriodFeeder::new(engine.host(), "none".into(), 16, 2);
        let mut data = vec![1.0; 40];
        feeder.fill(&mut data);
        assert!(data.iter().all(|s| *s == 0.0));
        assert_eq!(engine.mode(), Mode::Normal);
    }

    #[test]
    fn test_feeder_chunks_device_buffers() {
        let engine = engine(16);
        let out = engine.create_machine("io.live_out", None).unwrap();
        let sine = engine.create_machine("osc.sine", None).unwrap();
        engine.attach(&sine, "Mono", &out, "Stereo").unwrap();
        engine.play().unwrap();

        let mut feeder = PeriodFeeder::new(engine.host(), out.clone(), 16, 2);
        // 20 frames per device buffer against 16 frame periods.
        let mut data = vec![0.0; 40];
        for _ in 0..8 {
            feeder.fill(&mut data);
        }
        assert_eq!(engine.mode(), Mode::RealTime);
        assert!(engine.host().is_realtime_thread());
        assert!(data.iter().any(|s| s.abs() > 0.01));

        // Frames of a stereo period come out as identical pairs.
        for frame in data.chunks(2) {
            assert_eq!(frame[0], frame[1]);
        }
        engine.leave_realtime().unwrap();
        assert_eq!(engine.mode(), Mode::Normal);
    }
}
