//! Rack Engine Library
//!
//! Core of a modular audio workstation: a graph of machines connected by
//! signals, pulled period by period from a real-time audio callback while
//! other threads mutate it through a serializing operation channel.

pub mod config;
pub mod dsp;
pub mod engine;
pub mod machines;
pub mod persistence;

pub use config::EngineConfig;
pub use engine::{Engine, EngineError, EngineResult, ErrorKind};
