//! MIDI input
//!
//! Receives MIDI from hardware controllers and virtual ports through midir and
//! forwards control changes into the engine. Forwarding is fire-and-forget so
//! the midir callback thread never waits on the graph.

use midir::{MidiInput as PortScanner, MidiInputConnection, MidiInputPort};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dsp::signal::MidiMessage;

use super::error::EngineError;
use super::handle::HostHandle;

const CLIENT_NAME: &str = "rack_engine";

/// Information about a MIDI input port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiDeviceInfo {
    /// Human-readable port name.
    pub name: String,
    /// Index in the port list (for selection).
    pub index: usize,
}

/// Error type for MIDI operations.
#[derive(Debug, Error)]
pub enum MidiError {
    #[error("MIDI init error: {0}")]
    InitError(String),
    #[error("MIDI connection error: {0}")]
    ConnectionError(String),
    #[error("MIDI device not found")]
    DeviceNotFound,
}

impl From<MidiError> for EngineError {
    fn from(err: MidiError) -> Self {
        EngineError::SyscallFailure(err.to_string())
    }
}

/// Extracts (controller, value) from a control-change message on any channel.
pub fn control_change(bytes: &[u8]) -> Option<(u8, u8)> {
    if bytes.len() < 3 {
        return None;
    }
    match MidiMessage::parse(bytes)? {
        (_, MidiMessage::ControlChange { controller, value }) => Some((controller, value)),
        _ => None,
    }
}

/// A MIDI input port connected to an engine.
pub struct MidiInput {
    host: HostHandle,
    devices: Vec<MidiDeviceInfo>,
    selected: Option<usize>,
    connection: Option<MidiInputConnection<()>>,
}

impl MidiInput {
    pub fn new(host: HostHandle) -> Self {
        Self {
            host,
            devices: Vec::new(),
            selected: None,
            connection: None,
        }
    }

    fn scanner() -> Result<PortScanner, MidiError> {
        PortScanner::new(CLIENT_NAME).map_err(|e| MidiError::InitError(e.to_string()))
    }

    /// Rescans the available input ports.
    pub fn enumerate_devices(&mut self) -> Result<Vec<MidiDeviceInfo>, MidiError> {
        let scanner = Self::scanner()?;
        self.devices = scanner
            .ports()
            .iter()
            .enumerate()
            .map(|(index, port)| MidiDeviceInfo {
                name: scanner
                    .port_name(port)
                    .unwrap_or_else(|_| "Unknown".to_string()),
                index,
            })
            .collect();
        Ok(self.devices.clone())
    }

    /// The port list from the last scan.
    pub fn devices(&self) -> &[MidiDeviceInfo] {
        &self.devices
    }

    pub fn selected_device(&self) -> Option<usize> {
        self.selected
    }

    /// Connects to a port by index, replacing any existing connection.
    pub fn connect(&mut self, index: usize) -> Result<(), MidiError> {
        self.disconnect();

        let scanner = Self::scanner()?;
        let ports: Vec<MidiInputPort> = scanner.ports();
        let port = ports.get(index).ok_or(MidiError::DeviceNotFound)?;
        let name = scanner
            .port_name(port)
            .unwrap_or_else(|_| "Unknown".to_string());

        let host = self.host.clone();
        let connection = scanner
            .connect(
                port,
                "rack_engine-in",
                move |_timestamp_us, data, _| {
                    let Some((cc, value)) = control_change(data) else {
                        return;
                    };
                    debug!(cc, value, "MIDI control change");
                    if let Err(err) = host.apply_midi_cc(cc, value) {
                        warn!(error = %err, "dropping MIDI control change");
                    }
                },
                (),
            )
            .map_err(|e| MidiError::ConnectionError(e.to_string()))?;

        self.connection = Some(connection);
        self.selected = Some(index);
        info!(device = index, name = %name, "MIDI connected");
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
            self.selected = None;
            info!("MIDI disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

impl Drop for MidiInput {
    fn drop(&mut self) {
        self.disconnect();
    }
}
