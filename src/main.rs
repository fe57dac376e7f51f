//! Rack Engine demo host
//!
//! Builds a small graph (two sines through a mixer into the live output) or
//! loads a project, then plays it on the default audio device.
//!
//! Usage: `rack_engine [config.json] [project.json]`

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rack_engine::dsp::controller::ControllerValue;
use rack_engine::dsp::signal::Dimension;
use rack_engine::engine::{AudioBackend, Engine, EngineEvent, MidiInput};
use rack_engine::machines::builtin_registry;
use rack_engine::persistence;
use rack_engine::{EngineConfig, EngineError};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "rack_engine failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), EngineError> {
    let mut args = std::env::args().skip(1).map(PathBuf::from);
    let config = match args.next() {
        Some(path) => EngineConfig::load_from_file(&path)?,
        None => EngineConfig::default(),
    };
    let project = args.next();

    let engine = Engine::new(&config, builtin_registry()?)?;
    let audio = match AudioBackend::new() {
        Ok(audio) => {
            engine.set_signal_defaults(Dimension::Audio, audio.preferred_defaults())?;
            Some(audio)
        }
        Err(err) => {
            warn!(error = %err, "no audio device, rendering offline");
            None
        }
    };

    match project {
        Some(path) => {
            let project = persistence::load_from_file(&path)?;
            persistence::restore(&engine, &project)?;
        }
        None => build_demo(&engine)?,
    }
    info!(chain = ?engine.render_chain()?, "graph ready");

    let mut midi = MidiInput::new(engine.host());
    match midi.enumerate_devices() {
        Ok(devices) if !devices.is_empty() => {
            if let Err(err) = midi.connect(0) {
                warn!(error = %err, "MIDI unavailable");
            }
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "MIDI unavailable"),
    }

    engine.play()?;
    match audio {
        Some(mut audio) => {
            audio.start(&engine)?;
            info!("playing, press enter to stop");
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            audio.stop()?;
        }
        None => render_offline(&engine)?,
    }
    engine.stop()?;

    for event in engine.drain_events() {
        match event {
            EngineEvent::ExecuteFailed { machine, message } => {
                warn!(machine = %machine, message = %message, "machine failed")
            }
            other => info!(event = ?other, "engine event"),
        }
    }
    Ok(())
}

fn build_demo(engine: &Engine) -> Result<(), EngineError> {
    let out = engine.create_machine("io.live_out", None)?;
    let mixer = engine.create_machine("util.mixer", None)?;
    let low = engine.create_machine("osc.sine", None)?;
    let high = engine.create_machine("osc.sine", None)?;

    engine.set_controller(&low, "frequency", ControllerValue::Float(220.0))?;
    engine.set_controller(&high, "frequency", ControllerValue::Float(330.0))?;
    engine.set_controller(&mixer, "gain", ControllerValue::Float(0.5))?;
    engine.set_midi_controller(&mixer, "gain", 7, None)?;

    engine.attach(&low, "Mono", &mixer, "Stereo")?;
    engine.attach(&high, "Mono", &mixer, "Stereo")?;
    engine.attach(&mixer, "Stereo", &out, "Stereo")?;
    Ok(())
}

fn render_offline(engine: &Engine) -> Result<(), EngineError> {
    let sink = engine
        .sink_name()?
        .ok_or_else(|| EngineError::sanity("no sink registered"))?;
    let frames = engine.signal_defaults()?[Dimension::Audio.index()].map_or(0, |d| d.samples);
    let mut buffer = vec![0.0; frames * 2];
    let mut peak = 0.0f32;
    for _ in 0..64 {
        engine.fill_sink(&sink, &mut buffer, 2)?;
        peak = buffer.iter().fold(peak, |p, s| p.max(s.abs()));
    }
    let (line, tick) = engine.position_in_song()?;
    info!(peak, line, tick, "offline render finished");
    Ok(())
}
