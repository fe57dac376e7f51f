//! The engine facade.
//!
//! [`Engine`] is what applications hold. Every method is a closure submitted
//! through the operation channel, so calls from any thread are serialized
//! against each other and against the audio thread.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::dsp::controller::{ControllerValue, MidiBinding};
use crate::dsp::math::MathTables;
use crate::dsp::plugin::{MachineInfo, PluginContext};
use crate::dsp::registry::PluginRegistry;
use crate::dsp::signal::{DefaultsTable, Dimension, SignalDefaults};

use super::async_ops::AsyncOps;
use super::commands::{event_channel, EngineEvent, EventReceiver};
use super::error::{EngineError, EngineResult};
use super::handle::{HostHandle, Shared};
use super::listeners::MachineSetListener;
use super::machine::Machine;
use super::operations::{abort_on_fatal, FatalHandler, Mode, OperationChannel};
use super::space::{MachineSpace, SinkStatus, SpaceEnv};
use super::static_signals::StaticSignal;
use super::timing::{EngineState, PeriodicCallback};

/// Input name mapped to the (machine, output) pairs feeding it.
pub type InputConnections = Vec<(String, Vec<(String, String)>)>;

/// An audio workstation core: machine graph, scheduler and plugin registry.
pub struct Engine {
    shared: Arc<Shared>,
    async_ops: Arc<AsyncOps>,
    registry: PluginRegistry,
    events: Mutex<EventReceiver>,
}

impl Engine {
    /// Creates an engine that aborts the process on fatal errors.
    pub fn new(config: &EngineConfig, registry: PluginRegistry) -> EngineResult<Self> {
        Self::with_fatal_handler(config, registry, abort_on_fatal())
    }

    /// Creates an engine with a custom fatal error handler.
    ///
    /// Every fatal error is also published as [`EngineEvent::Fatal`] before the
    /// handler runs.
    pub fn with_fatal_handler(
        config: &EngineConfig,
        registry: PluginRegistry,
        fatal: FatalHandler,
    ) -> EngineResult<Self> {
        config.validate()?;
        let defaults = config.signals.table()?;
        let tempo = &config.tempo;
        let state = EngineState::new(
            tempo.bpm,
            tempo.lpb,
            tempo.loop_start,
            tempo.loop_length,
            tempo.looping,
            tempo.shuffle,
        )?;

        let async_ops = Arc::new(AsyncOps::new(config.async_pool_size)?);
        let (events, receiver) = event_channel(config.event_buffer_size);
        let fatal_events = events.clone();
        let fatal: FatalHandler = Arc::new(move |err: &EngineError| {
            fatal_events.send(EngineEvent::Fatal(err.to_string()));
            fatal(err);
        });
        let math = Arc::new(MathTables::new());

        let shared = Arc::new_cyclic(|weak| {
            let env = SpaceEnv {
                math,
                async_ops: Arc::clone(&async_ops),
                host: HostHandle::new(weak.clone()),
            };
            Shared {
                channel: OperationChannel::new(config.queue_capacity, config.drain_limit, fatal),
                space: Mutex::new(MachineSpace::new(state, defaults, env, events)),
                async_ops: Arc::clone(&async_ops),
            }
        });

        info!(
            machine_types = registry.len(),
            queue = config.queue_capacity,
            drain = config.drain_limit,
            "engine created"
        );
        Ok(Self {
            shared,
            async_ops,
            registry,
            events: Mutex::new(receiver),
        })
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn machine_types(&self) -> &[MachineInfo] {
        self.registry.list()
    }

    /// A handle for back-ends and plugins.
    pub fn host(&self) -> HostHandle {
        HostHandle::new(Arc::downgrade(&self.shared))
    }

    pub fn async_ops(&self) -> &AsyncOps {
        &self.async_ops
    }

    /// Blocks until all async work has finished.
    pub fn wait_for_pending_async(&self) {
        self.shared.settle_outbox();
        self.async_ops.wait_for_pending();
    }

    /// Notifications published by the engine since the last call.
    pub fn drain_events(&self) -> Vec<EngineEvent> {
        self.events.lock().drain().collect()
    }

    /// Runs a read-only closure against a consistent view of the space.
    pub fn read<R, F>(&self, f: F) -> EngineResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&MachineSpace) -> R + Send + 'static,
    {
        self.shared.run(move |space| Ok(f(space)))
    }

    /// Runs a closure with exclusive access to the space and returns its result.
    pub fn update<R, F>(&self, f: F) -> EngineResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut MachineSpace) -> EngineResult<R> + Send + 'static,
    {
        self.shared.run(f)
    }

    // ---- machines ----

    /// Creates and registers a machine, returning its name.
    ///
    /// The plugin instance is constructed on the calling thread; only name
    /// reservation and registration go through the channel. A default name
    /// taken by a concurrent create in between is picked again at registration.
    pub fn create_machine(&self, type_id: &str, name: Option<&str>) -> EngineResult<String> {
        let info = self
            .registry
            .info(type_id)
            .ok_or_else(|| EngineError::unknown("machine type", type_id))?;
        let base = info.base_name;
        let explicit = name.map(str::to_string);
        let (instance_name, defaults, math) = self.shared.run(move |space| {
            let name = space.reserve_name(base, explicit.as_deref())?;
            Ok((name, *space.defaults(), space.math()))
        })?;

        let context = PluginContext {
            instance_name: instance_name.clone(),
            defaults,
            math,
            host: self.host(),
        };
        let plugin = self.registry.create(type_id, &context)?;
        let mut machine = Machine::new(instance_name, plugin);
        let buffers = machine.allocate_buffers(&defaults)?;
        let default_named = name.is_none();
        self.shared.run(move |space| {
            if default_named && space.contains(machine.name()) {
                machine.set_name(space.reserve_name(base, None)?);
            }
            let registered = machine.name().to_string();
            space.register_machine(machine, buffers, &defaults)?;
            Ok(registered)
        })
    }

    /// Detaches, destroys and deregisters a machine and its tight partners.
    pub fn destroy_machine(&self, name: &str) -> EngineResult<()> {
        let name = name.to_string();
        self.shared
            .run(move |space| space.disconnect_and_destroy(&name))
    }

    pub fn destroy_all_machines(&self) -> EngineResult<()> {
        self.shared.run(|space| space.destroy_all_machines())
    }

    pub fn machine_names(&self) -> EngineResult<Vec<String>> {
        self.read(|space| space.machine_names())
    }

    pub fn contains_machine(&self, name: &str) -> EngineResult<bool> {
        let name = name.to_string();
        self.read(move |space| space.contains(&name))
    }

    pub fn machine_type(&self, name: &str) -> EngineResult<String> {
        let name = name.to_string();
        self.shared
            .run(move |space| space.type_of(&name).map(str::to_string))
    }

    pub fn set_machine_name(&self, name: &str, new_name: &str) -> EngineResult<()> {
        let (name, new_name) = (name.to_string(), new_name.to_string());
        self.shared
            .run(move |space| space.set_name(&name, &new_name))
    }

    pub fn set_position(&self, name: &str, x: f32, y: f32) -> EngineResult<()> {
        let name = name.to_string();
        self.shared
            .run(move |space| space.set_position(&name, x, y))
    }

    pub fn position(&self, name: &str) -> EngineResult<(f32, f32)> {
        let name = name.to_string();
        self.shared.run(move |space| space.position(&name))
    }

    pub fn tightly_connect(&self, a: &str, b: &str) -> EngineResult<()> {
        let (a, b) = (a.to_string(), b.to_string());
        self.shared.run(move |space| space.tightly_connect(&a, &b))
    }

    pub fn tightly_connected(&self, name: &str) -> EngineResult<Vec<String>> {
        let name = name.to_string();
        self.shared.run(move |space| space.tightly_connected(&name))
    }

    // ---- wiring ----

    pub fn attach(&self, source: &str, output: &str, destination: &str, input: &str) -> EngineResult<()> {
        let args = [source, output, destination, input].map(str::to_string);
        self.shared.run(move |space| {
            let [source, output, destination, input] = &args;
            space.attach(source, output, destination, input)
        })
    }

    pub fn detach(&self, source: &str, output: &str, destination: &str, input: &str) -> EngineResult<()> {
        let args = [source, output, destination, input].map(str::to_string);
        self.shared.run(move |space| {
            let [source, output, destination, input] = &args;
            space.detach(source, output, destination, input)
        })
    }

    pub fn input_names(&self, machine: &str) -> EngineResult<Vec<String>> {
        let machine = machine.to_string();
        self.shared.run(move |space| space.input_names(&machine))
    }

    pub fn output_names(&self, machine: &str) -> EngineResult<Vec<String>> {
        let machine = machine.to_string();
        self.shared.run(move |space| space.output_names(&machine))
    }

    pub fn input_connections(&self, machine: &str) -> EngineResult<InputConnections> {
        let machine = machine.to_string();
        self.shared
            .run(move |space| space.input_connections(&machine))
    }

    // ---- controllers ----

    pub fn controller_groups(&self, machine: &str) -> EngineResult<Vec<String>> {
        let machine = machine.to_string();
        self.shared
            .run(move |space| space.controller_groups(&machine))
    }

    pub fn controller_names(&self, machine: &str, group: Option<&str>) -> EngineResult<Vec<String>> {
        let machine = machine.to_string();
        let group = group.map(str::to_string);
        self.shared
            .run(move |space| space.controller_names(&machine, group.as_deref()))
    }

    pub fn get_controller(&self, machine: &str, controller: &str) -> EngineResult<ControllerValue> {
        let (machine, controller) = (machine.to_string(), controller.to_string());
        self.shared
            .run(move |space| space.get_controller(&machine, &controller))
    }

    /// Writes a controller value. Out-of-range numbers are ignored.
    pub fn set_controller(&self, machine: &str, controller: &str, value: ControllerValue) -> EngineResult<()> {
        let (machine, controller) = (machine.to_string(), controller.to_string());
        self.shared
            .run(move |space| space.set_controller(&machine, &controller, &value))
    }

    pub fn controller_value_name(&self, machine: &str, controller: &str, value: i32) -> EngineResult<String> {
        let (machine, controller) = (machine.to_string(), controller.to_string());
        self.shared
            .run(move |space| space.controller_value_name(&machine, &controller, value))
    }

    pub fn set_midi_controller(
        &self,
        machine: &str,
        controller: &str,
        coarse: i32,
        fine: Option<i32>,
    ) -> EngineResult<()> {
        let (machine, controller) = (machine.to_string(), controller.to_string());
        self.shared.run(move |space| {
            space.set_midi_controller(&machine, &controller, coarse, fine)
        })
    }

    pub fn midi_binding(&self, machine: &str, controller: &str) -> EngineResult<Option<MidiBinding>> {
        let (machine, controller) = (machine.to_string(), controller.to_string());
        self.shared
            .run(move |space| space.midi_binding(&machine, &controller))
    }

    /// Forwards a MIDI control change to bound controllers without waiting.
    pub fn apply_midi_cc(&self, cc: u8, value: u8) -> EngineResult<()> {
        self.shared.fire(move |space| space.apply_midi_cc(cc, value))
    }

    // ---- sink ----

    pub fn register_sink(&self, name: &str) -> EngineResult<()> {
        let name = name.to_string();
        self.shared.run(move |space| space.register_sink(&name))
    }

    pub fn unregister_sink(&self, name: &str) -> EngineResult<()> {
        let name = name.to_string();
        self.shared.run(move |space| space.unregister_sink(&name))
    }

    pub fn sink_name(&self) -> EngineResult<Option<String>> {
        self.read(|space| space.sink_name())
    }

    pub fn render_chain(&self) -> EngineResult<Vec<String>> {
        self.read(|space| space.render_chain_names())
    }

    /// Renders one period for `sink`. See [`HostHandle::fill_sink`].
    pub fn fill_sink(&self, sink: &str, output: &mut [f32], channels: usize) -> EngineResult<SinkStatus> {
        self.shared.fill_sink(sink, output, channels)
    }

    pub fn mode(&self) -> Mode {
        self.shared.channel.mode()
    }

    /// Enters low latency mode with the calling thread as the real-time thread.
    pub fn enter_realtime(&self) -> EngineResult<()> {
        self.shared.enter_realtime()
    }

    pub fn leave_realtime(&self) -> EngineResult<()> {
        self.shared.leave_realtime()
    }

    // ---- scheduler ----

    pub fn bpm(&self) -> EngineResult<i32> {
        self.read(|space| space.state().bpm())
    }

    pub fn set_bpm(&self, bpm: i32) -> EngineResult<()> {
        self.shared.run(move |space| space.state_mut().set_bpm(bpm))
    }

    pub fn lpb(&self) -> EngineResult<i32> {
        self.read(|space| space.state().lpb())
    }

    pub fn set_lpb(&self, lpb: i32) -> EngineResult<()> {
        self.shared.run(move |space| space.state_mut().set_lpb(lpb))
    }

    /// Loop start and length in lines.
    pub fn loop_bounds(&self) -> EngineResult<(i32, i32)> {
        self.read(|space| (space.state().loop_start(), space.state().loop_length()))
    }

    pub fn set_loop_start(&self, line: i32) -> EngineResult<()> {
        self.shared
            .run(move |space| space.state_mut().set_loop_start(line))
    }

    pub fn set_loop_length(&self, length: i32) -> EngineResult<()> {
        self.shared
            .run(move |space| space.state_mut().set_loop_length(length))
    }

    pub fn is_looping(&self) -> EngineResult<bool> {
        self.read(|space| space.state().is_looping())
    }

    pub fn set_looping(&self, looping: bool) -> EngineResult<()> {
        self.shared.run(move |space| {
            space.state_mut().set_looping(looping);
            Ok(())
        })
    }

    pub fn shuffle(&self) -> EngineResult<i32> {
        self.read(|space| space.state().shuffle())
    }

    pub fn set_shuffle(&self, shuffle: i32) -> EngineResult<()> {
        self.shared
            .run(move |space| space.state_mut().set_shuffle(shuffle))
    }

    pub fn play(&self) -> EngineResult<()> {
        self.shared.fire(|space| {
            space.state_mut().play();
            Ok(())
        })
    }

    pub fn stop(&self) -> EngineResult<()> {
        self.shared.fire(|space| {
            space.state_mut().stop();
            Ok(())
        })
    }

    pub fn is_playing(&self) -> EngineResult<bool> {
        self.read(|space| space.state().is_playing())
    }

    /// Current (line, tick) position.
    pub fn position_in_song(&self) -> EngineResult<(i32, i32)> {
        self.read(|space| (space.state().line(), space.state().tick()))
    }

    /// Repositions the sequencer and returns once the new line is in effect.
    pub fn jump_to(&self, line: i32) -> EngineResult<()> {
        self.shared.run(move |space| {
            space.jump_to(line);
            Ok(())
        })
    }

    pub fn rewind(&self) -> EngineResult<()> {
        self.shared.fire(|space| {
            space.rewind();
            Ok(())
        })
    }

    pub fn set_record(&self, recording: bool, filename: Option<String>) -> EngineResult<()> {
        self.shared.run(move |space| {
            space.state_mut().set_record(recording, filename);
            Ok(())
        })
    }

    pub fn is_recording(&self) -> EngineResult<bool> {
        self.read(|space| space.state().is_recording())
    }

    pub fn record_filename(&self) -> EngineResult<String> {
        self.read(|space| space.state().record_filename().to_string())
    }

    pub fn set_loading(&self, loading: bool) -> EngineResult<()> {
        self.shared.run(move |space| {
            space.set_loading(loading);
            Ok(())
        })
    }

    pub fn is_loading(&self) -> EngineResult<bool> {
        self.read(|space| space.state().is_loading())
    }

    pub fn signal_defaults(&self) -> EngineResult<DefaultsTable> {
        self.read(|space| *space.defaults())
    }

    pub fn set_signal_defaults(&self, dimension: Dimension, defaults: SignalDefaults) -> EngineResult<()> {
        self.shared
            .run(move |space| space.set_signal_defaults(dimension, defaults))
    }

    /// Calls `callback` on the async worker every `interval` lines.
    pub fn register_periodic(&self, callback: PeriodicCallback, interval: i32) -> EngineResult<()> {
        self.shared
            .run(move |space| space.register_periodic(callback, interval))
    }

    pub fn unregister_periodic(&self, callback: &PeriodicCallback) -> EngineResult<()> {
        let callback = Arc::clone(callback);
        self.shared.run(move |space| {
            space.unregister_periodic(&callback);
            Ok(())
        })
    }

    // ---- listeners ----

    /// Adds a listener. It is told about every existing machine right away.
    pub fn register_machine_set_listener(&self, listener: Arc<dyn MachineSetListener>) -> EngineResult<()> {
        self.shared.run(move |space| {
            space.add_listener(listener);
            Ok(())
        })
    }

    pub fn unregister_machine_set_listener(&self, listener: &Arc<dyn MachineSetListener>) -> EngineResult<()> {
        let listener = Arc::clone(listener);
        self.shared.run(move |space| {
            space.remove_listener(&listener);
            Ok(())
        })
    }

    // ---- static signals ----

    pub fn set_static_signal(&self, index: i32, signal: StaticSignal) -> EngineResult<()> {
        self.shared
            .run(move |space| space.set_static_signal(index, signal))
    }

    pub fn clear_static_signal(&self, index: i32) -> EngineResult<()> {
        self.shared
            .run(move |space| space.clear_static_signal(index))
    }

    /// Names of loaded static signals by slot.
    pub fn static_signal_names(&self) -> EngineResult<Vec<(i32, String)>> {
        self.read(|space| {
            space
                .static_signals()
                .iter()
                .map(|(i, s)| (i, s.name.clone()))
                .collect()
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.shared.leave_realtime() {
            warn!(error = %err, "failed to leave low latency mode on shutdown");
        }
        self.shared.settle_outbox();
        self.async_ops.shutdown();
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::listeners::MachineRef;
    use crate::engine::ErrorKind;
    use crate::machines::register_builtin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn builtin_registry_for_tests() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        register_builtin(&mut registry).unwrap();
        registry
    }

    fn engine() -> Engine {
        let registry = builtin_registry_for_tests();
        let mut config = EngineConfig::default();
        config.signals.audio = Some(SignalDefaults::new(64, crate::dsp::signal::Resolution::Float32, 44100));
        Engine::with_fatal_handler(
            &config,
            registry,
            Arc::new(|err: &EngineError| panic!("fatal: {}", err)),
        )
        .unwrap()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_create_machines_and_render() {
        let engine = engine();
        let out = engine.create_machine("io.live_out", None).unwrap();
        let sine = engine.create_machine("osc.sine", None).unwrap();
        assert_eq!(out, "m#0:LiveOut");
        assert_eq!(sine, "m#1:Sine");
        assert_eq!(engine.sink_name().unwrap().as_deref(), Some(out.as_str()));

        engine.attach(&sine, "Mono", &out, "Stereo").unwrap();
        assert_eq!(engine.render_chain().unwrap(), vec![sine.clone(), out.clone()]);

        let mut buffer = vec![0.0; 128];
        assert_eq!(engine.fill_sink(&out, &mut buffer, 2).unwrap(), SinkStatus::Paused);
        engine.play().unwrap();
        assert_eq!(engine.fill_sink(&out, &mut buffer, 2).unwrap(), SinkStatus::Resumed);
        assert_eq!(engine.fill_sink(&out, &mut buffer, 2).unwrap(), SinkStatus::JustPlay);
        assert!(buffer.iter().any(|s| s.abs() > 0.01));
        assert_eq!(
            engine.fill_sink(&sine, &mut buffer, 2).unwrap(),
            SinkStatus::NotASink
        );

        engine.detach(&sine, "Mono", &out, "Stereo").unwrap();
        assert_eq!(engine.render_chain().unwrap(), vec![out]);
    }

    #[test]
    fn test_first_pull_after_play_resumes() {
        let engine = engine();
        let out = engine.create_machine("io.live_out", None).unwrap();
        let sine = engine.create_machine("osc.sine", None).unwrap();
        engine.attach(&sine, "Mono", &out, "Stereo").unwrap();

        engine.play().unwrap();
        let mut buffer = vec![1.0; 128];
        assert_eq!(engine.fill_sink(&out, &mut buffer, 2).unwrap(), SinkStatus::Resumed);
        assert!(buffer.iter().all(|s| *s == 0.0));
        assert_eq!(engine.fill_sink(&out, &mut buffer, 2).unwrap(), SinkStatus::JustPlay);
    }

    #[test]
    fn test_unknown_type_and_duplicate_name() {
        let engine = engine();
        assert_eq!(
            engine.create_machine("no.such", None).unwrap_err().kind(),
            ErrorKind::UnknownName
        );
        engine.create_machine("osc.sine", Some("lead")).unwrap();
        assert_eq!(
            engine
                .create_machine("osc.sine", Some("lead"))
                .unwrap_err()
                .kind(),
            ErrorKind::SanityViolation
        );
    }

    #[test]
    fn test_concurrent_default_names_are_unique() {
        let engine = engine();
        let names: Vec<String> = thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| engine.create_machine("osc.sine", None).unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 8);
        assert_eq!(engine.machine_names().unwrap().len(), 8);
        assert!(names.iter().all(|n| n.ends_with(":Sine")));
    }

    #[test]
    fn test_two_sinks() {
        let engine = engine();
        let first = engine.create_machine("io.live_out", None).unwrap();
        assert_eq!(
            engine.create_machine("io.live_out", None).unwrap_err().kind(),
            ErrorKind::SanityViolation
        );
        engine.unregister_sink(&first).unwrap();
        let second = engine.create_machine("io.live_out", Some("main")).unwrap();
        assert_eq!(engine.sink_name().unwrap(), Some(second));
    }

    #[test]
    fn test_scheduler_validation() {
        let engine = engine();
        assert_eq!(engine.set_bpm(10).unwrap_err().kind(), ErrorKind::ParameterOutOfSpec);
        assert_eq!(engine.set_lpb(30).unwrap_err().kind(), ErrorKind::ParameterOutOfSpec);
        engine.set_bpm(140).unwrap();
        assert_eq!(engine.bpm().unwrap(), 140);
        engine.set_loop_start(8).unwrap();
        engine.set_loop_length(16).unwrap();
        assert_eq!(engine.loop_bounds().unwrap(), (8, 16));
        engine.jump_to(12).unwrap();
        assert_eq!(engine.position_in_song().unwrap(), (12, 0));
        engine.rewind().unwrap();
        assert_eq!(engine.position_in_song().unwrap(), (8, 0));
    }

    #[test]
    fn test_realtime_requires_sink() {
        let engine = engine();
        assert_eq!(
            engine.enter_realtime().unwrap_err().kind(),
            ErrorKind::SanityViolation
        );
        assert_eq!(engine.mode(), Mode::Normal);
    }

    #[test]
    fn test_realtime_operations_are_drained_by_pull() {
        let engine = Arc::new(engine());
        let out = engine.create_machine("io.live_out", None).unwrap();
        let sine = engine.create_machine("osc.sine", None).unwrap();
        engine.play().unwrap();

        let host = engine.host();
        let audio_out = out.clone();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let audio_stop = Arc::clone(&stop);
        let audio = thread::spawn(move || {
            host.enter_realtime().unwrap();
            let mut buffer = vec![0.0; 128];
            while !audio_stop.load(Ordering::SeqCst) {
                host.fill_sink(&audio_out, &mut buffer, 2).unwrap();
                thread::sleep(Duration::from_millis(1));
            }
            host.leave_realtime().unwrap();
        });

        wait_for(|| engine.mode() == Mode::RealTime);
        engine.attach(&sine, "Mono", &out, "Stereo").unwrap();
        assert_eq!(engine.render_chain().unwrap(), vec![sine.clone(), out.clone()]);
        assert_eq!(
            engine.attach(&out, "Stereo", &sine, "Mono").unwrap_err().kind(),
            ErrorKind::UnknownName
        );
        let mut buffer = vec![0.0; 128];
        assert_eq!(
            engine.fill_sink(&out, &mut buffer, 2).unwrap_err().kind(),
            ErrorKind::SanityViolation
        );

        // Queued behind the stop, so the position is settled when it returns.
        engine.stop().unwrap();
        engine.jump_to(12).unwrap();
        assert_eq!(engine.position_in_song().unwrap(), (12, 0));

        stop.store(true, Ordering::SeqCst);
        audio.join().unwrap();
        assert_eq!(engine.mode(), Mode::Normal);
    }

    struct Recorder {
        registered: AtomicUsize,
        unregistered: AtomicUsize,
        attached: AtomicUsize,
        loaded: AtomicUsize,
    }

    impl MachineSetListener for Recorder {
        fn project_loaded(&self) {
            self.loaded.fetch_add(1, Ordering::SeqCst);
        }

        fn machine_registered(&self, _machine: &MachineRef) {
            self.registered.fetch_add(1, Ordering::SeqCst);
        }

        fn machine_unregistered(&self, _machine: &MachineRef) {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
        }

        fn machine_input_attached(&self, _s: &MachineRef, _d: &MachineRef, _o: &str, _i: &str) {
            self.attached.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_listener_lifecycle() {
        let engine = engine();
        let out = engine.create_machine("io.live_out", None).unwrap();
        let recorder = Arc::new(Recorder {
            registered: AtomicUsize::new(0),
            unregistered: AtomicUsize::new(0),
            attached: AtomicUsize::new(0),
            loaded: AtomicUsize::new(0),
        });
        let listener: Arc<dyn MachineSetListener> = recorder.clone();
        engine.register_machine_set_listener(Arc::clone(&listener)).unwrap();

        let sine = engine.create_machine("osc.sine", None).unwrap();
        engine.attach(&sine, "Mono", &out, "Stereo").unwrap();
        engine.destroy_machine(&sine).unwrap();
        engine.set_loading(true).unwrap();
        engine.set_loading(false).unwrap();
        engine.wait_for_pending_async();

        assert_eq!(recorder.registered.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.unregistered.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.attached.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.loaded.load(Ordering::SeqCst), 1);

        // Released once every notice holding a reference was delivered.
        wait_for(|| {
            engine.wait_for_pending_async();
            engine.read(|space| space.allocated_count()).unwrap() == 1
        });
    }

    struct Gate {
        release: crossbeam_channel::Receiver<()>,
        registered: AtomicUsize,
    }

    impl MachineSetListener for Gate {
        fn machine_registered(&self, _machine: &MachineRef) {
            let _ = self.release.recv();
            self.registered.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_pull_does_not_wait_for_exhausted_pool() {
        let mut config = EngineConfig::default();
        config.signals.audio = Some(SignalDefaults::new(64, crate::dsp::signal::Resolution::Float32, 44100));
        config.async_pool_size = 1;
        let engine = Engine::with_fatal_handler(
            &config,
            builtin_registry_for_tests(),
            Arc::new(|err: &EngineError| panic!("fatal: {}", err)),
        )
        .unwrap();

        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let gate = Arc::new(Gate {
            release: release_rx,
            registered: AtomicUsize::new(0),
        });
        let listener: Arc<dyn MachineSetListener> = gate.clone();
        engine.register_machine_set_listener(Arc::clone(&listener)).unwrap();

        // The first notice occupies the only work item; the rest have to wait.
        let start = Instant::now();
        let out = engine.create_machine("io.live_out", None).unwrap();
        engine.create_machine("osc.sine", None).unwrap();
        engine.create_machine("osc.sine", None).unwrap();
        let mut buffer = vec![0.0; 128];
        for _ in 0..4 {
            engine.fill_sink(&out, &mut buffer, 2).unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(engine.read(|space| space.outbox_len()).unwrap() > 0);

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        engine.wait_for_pending_async();
        assert_eq!(gate.registered.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_periodic_callback_runs_on_worker() {
        let engine = engine();
        let out = engine.create_machine("io.live_out", None).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let callback: PeriodicCallback = Arc::new(move |_line| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        engine.register_periodic(Arc::clone(&callback), 1).unwrap();
        assert_eq!(
            engine.register_periodic(Arc::clone(&callback), 0).unwrap_err().kind(),
            ErrorKind::ParameterOutOfSpec
        );

        engine.play().unwrap();
        let mut buffer = vec![0.0; 128];
        for _ in 0..20 {
            engine.fill_sink(&out, &mut buffer, 2).unwrap();
        }
        engine.wait_for_pending_async();
        assert!(fired.load(Ordering::SeqCst) > 0);

        engine.unregister_periodic(&callback).unwrap();
        let before = fired.load(Ordering::SeqCst);
        for _ in 0..20 {
            engine.fill_sink(&out, &mut buffer, 2).unwrap();
        }
        engine.wait_for_pending_async();
        assert_eq!(fired.load(Ordering::SeqCst), before);
    }

    #[test]
    fn test_controllers_via_engine() {
        let engine = engine();
        let sine = engine.create_machine("osc.sine", None).unwrap();
        engine
            .set_controller(&sine, "frequency", ControllerValue::Float(220.0))
            .unwrap();
        assert_eq!(
            engine.get_controller(&sine, "frequency").unwrap(),
            ControllerValue::Float(220.0)
        );
        engine.set_midi_controller(&sine, "amplitude", 7, None).unwrap();
        engine.apply_midi_cc(7, 0).unwrap();
        assert_eq!(
            engine.get_controller(&sine, "amplitude").unwrap(),
            ControllerValue::Float(0.0)
        );
        assert_eq!(
            engine.get_controller("ghost", "frequency").unwrap_err().kind(),
            ErrorKind::UnknownName
        );
    }
}
