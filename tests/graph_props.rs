//! Property tests for render-chain ordering, cycle rejection, loop bounds and shuffle range.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use proptest::prelude::*;

use rack_engine::dsp::signal::{builtin_defaults, Dimension, Resolution, SignalDefaults};
use rack_engine::engine::timing::MAX_SHUFFLE;
use rack_engine::engine::{EngineState, ErrorKind};
use rack_engine::machines::builtin_registry;
use rack_engine::{Engine, EngineConfig, EngineError};

fn engine() -> Engine {
    let mut config = EngineConfig::default();
    config.signals.audio = Some(SignalDefaults::new(16, Resolution::Float32, 44100));
    config.async_pool_size = 8;
    Engine::with_fatal_handler(
        &config,
        builtin_registry().unwrap(),
        Arc::new(|err: &EngineError| panic!("fatal: {}", err)),
    )
    .unwrap()
}

/// Mixer count, forward edges between mixers, and which mixers feed the sink.
fn graph() -> impl Strategy<Value = (usize, BTreeSet<(usize, usize)>, Vec<bool>)> {
    (2usize..8).prop_flat_map(|n| {
        let edges = prop::collection::btree_set((0..n, 0..n), 0..n * 2).prop_map(|pairs| {
            pairs
                .into_iter()
                .filter(|(a, b)| a != b)
                .map(|(a, b)| (a.min(b), a.max(b)))
                .collect::<BTreeSet<_>>()
        });
        (Just(n), edges, prop::collection::vec(any::<bool>(), n))
    })
}

fn node(i: usize) -> String {
    format!("n{}", i)
}

/// Builds the graph and returns it with the sink name.
fn build(engine: &Engine, n: usize, edges: &BTreeSet<(usize, usize)>, to_sink: &[bool]) -> String {
    let out = engine.create_machine("io.live_out", Some("out")).unwrap();
    for i in 0..n {
        engine.create_machine("util.mixer", Some(&node(i))).unwrap();
    }
    for (a, b) in edges {
        engine.attach(&node(*a), "Stereo", &node(*b), "Stereo").unwrap();
    }
    for (i, feeds) in to_sink.iter().enumerate() {
        if *feeds {
            engine.attach(&node(i), "Stereo", &out, "Stereo").unwrap();
        }
    }
    out
}

/// True if `from` reaches `to` along edges.
fn reaches(from: usize, to: usize, edges: &BTreeSet<(usize, usize)>) -> bool {
    let mut stack = vec![from];
    let mut seen = BTreeSet::new();
    while let Some(at) = stack.pop() {
        if at == to {
            return true;
        }
        if seen.insert(at) {
            stack.extend(edges.iter().filter(|(a, _)| *a == at).map(|(_, b)| *b));
        }
    }
    false
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_chain_orders_producers_first((n, edges, to_sink) in graph()) {
        let engine = engine();
        let out = build(&engine, n, &edges, &to_sink);
        let chain = engine.render_chain().unwrap();
        let position: HashMap<&str, usize> =
            chain.iter().enumerate().map(|(i, name)| (name.as_str(), i)).collect();

        prop_assert_eq!(chain.last(), Some(&out));
        prop_assert_eq!(position.len(), chain.len());

        for (a, b) in &edges {
            if let (Some(pa), Some(pb)) = (position.get(node(*a).as_str()), position.get(node(*b).as_str())) {
                prop_assert!(pa < pb, "{} must run before {}", node(*a), node(*b));
            }
        }

        for i in 0..n {
            let feeds_sink = (0..n).any(|j| to_sink[j] && reaches(i, j, &edges));
            prop_assert_eq!(position.contains_key(node(i).as_str()), feeds_sink);
        }
    }

    #[test]
    fn prop_back_edges_are_rejected((n, edges, to_sink) in graph()) {
        let engine = engine();
        build(&engine, n, &edges, &to_sink);
        let chain = engine.render_chain().unwrap();

        for a in 0..n {
            for b in (a + 1)..n {
                if reaches(a, b, &edges) {
                    let err = engine.attach(&node(b), "Stereo", &node(a), "Stereo").unwrap_err();
                    prop_assert_eq!(err.kind(), ErrorKind::CycleDetected);
                }
            }
            let err = engine.attach(&node(a), "Stereo", &node(a), "Stereo").unwrap_err();
            prop_assert_eq!(err.kind(), ErrorKind::CycleDetected);
        }
        prop_assert_eq!(engine.render_chain().unwrap(), chain);
    }

    #[test]
    fn prop_detach_restores_previous_chain((n, edges, to_sink) in graph(), extra in (0usize..8, 0usize..8)) {
        let (a, b) = (extra.0 % n, extra.1 % n);
        prop_assume!(a < b && !edges.contains(&(a, b)));
        let engine = engine();
        build(&engine, n, &edges, &to_sink);
        let before = engine.render_chain().unwrap();

        engine.attach(&node(a), "Stereo", &node(b), "Stereo").unwrap();
        engine.detach(&node(a), "Stereo", &node(b), "Stereo").unwrap();
        prop_assert_eq!(engine.render_chain().unwrap(), before);

        let err = engine.detach(&node(a), "Stereo", &node(b), "Stereo").unwrap_err();
        prop_assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[test]
    fn prop_line_stays_inside_loop(
        start in 0i32..64,
        length in 4i32..32,
        bpm in 20i32..=200,
        lpb in 2i32..=24,
        shuffle in 0i32..=MAX_SHUFFLE,
        periods in 1usize..400,
    ) {
        let defaults = builtin_defaults();
        let mut state = EngineState::new(bpm, lpb, start, length, true, shuffle).unwrap();
        state.rewind();
        for _ in 0..periods {
            state.calculate_samples_per_tick(&defaults);
            state.advance(&defaults, |_, _| {});
            prop_assert!(state.line() >= start && state.line() < start + length);
            prop_assert!(state.tick() >= 0 && state.tick() < 16);
        }
        prop_assert!(state.samples_per_tick(Dimension::Midi) > 0);
    }

    #[test]
    fn prop_shuffle_outside_range_rejected(shuffle in prop_oneof![i32::MIN..0, (MAX_SHUFFLE + 1)..i32::MAX]) {
        let err = EngineState::new(120, 4, 0, 16, true, shuffle).err().unwrap();
        prop_assert_eq!(err.kind(), ErrorKind::ParameterOutOfSpec);

        let mut state = EngineState::default();
        prop_assert!(state.set_shuffle(shuffle).is_err());
        prop_assert_eq!(state.shuffle(), 0);
    }

    #[test]
    fn prop_jump_snaps_outside_loop(start in 0i32..64, length in 4i32..32, target in -10i32..200) {
        let mut state = EngineState::new(120, 4, start, length, true, 0).unwrap();
        state.jump_to(target);
        if target < start || target > start + length {
            prop_assert_eq!(state.line(), start);
        } else {
            prop_assert_eq!(state.line(), target);
        }
        prop_assert_eq!(state.tick(), 0);

        state.set_looping(false);
        state.jump_to(target);
        prop_assert_eq!(state.line(), target);
    }
}
