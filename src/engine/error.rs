//! Error types for the machine graph and its scheduler.
//!
//! Every error is `Clone + Send` so it can travel through a synchronization
//! token from the audio thread back to the thread that submitted the operation.

use thiserror::Error;

/// Category of an [`EngineError`], used for matching without caring about messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ShapeMismatch,
    CycleDetected,
    NotConnected,
    UnknownName,
    ResourceExhausted,
    SyscallFailure,
    SanityViolation,
    ParameterOutOfSpec,
    Plugin,
}

/// Errors raised by graph mutation, scheduling and rendering.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EngineError {
    /// Signal dimension or channel count does not fit the input description.
    #[error("the signal type of output [{output}] does not match input [{input}]: {reason}")]
    ShapeMismatch {
        /// Output name on the source machine.
        output: String,
        /// Input name on the destination machine.
        input: String,
        /// What did not match.
        reason: String,
    },

    /// Attaching would make the destination reachable from itself.
    #[error("attaching [{source_machine}] to [{destination}] would create a cycle")]
    CycleDetected {
        /// Name of the prospective producer.
        source_machine: String,
        /// Name of the prospective consumer.
        destination: String,
    },

    /// Detach referenced an edge that does not exist.
    #[error("nothing attached to input [{input}] of [{machine}] from [{source_machine}]")]
    NotConnected {
        /// Consumer machine.
        machine: String,
        /// Input name on the consumer.
        input: String,
        /// Producer that was expected on the input.
        source_machine: String,
    },

    /// Lookup of a machine, input, output, controller or plugin type failed.
    #[error("unknown {what}: {name}")]
    UnknownName {
        /// What kind of thing was looked up ("machine", "input", ...).
        what: &'static str,
        /// The name that was not found.
        name: String,
    },

    /// A bounded pool or queue had no room, or an allocation was refused.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An operating system call failed (file I/O, thread spawn, audio device).
    #[error("system call failed: {0}")]
    SyscallFailure(String),

    /// An internal invariant was broken.
    #[error("sanity violation: {0}")]
    SanityViolation(String),

    /// A scheduler parameter was outside its accepted range.
    #[error("parameter out of spec: {name} = {value}")]
    ParameterOutOfSpec {
        /// Parameter name.
        name: &'static str,
        /// Rejected value.
        value: i64,
    },

    /// A plugin reported a failure from `init` or `execute`.
    #[error("machine [{machine}] failed: {message}")]
    Plugin {
        /// Machine instance name.
        machine: String,
        /// Message reported by the plugin.
        message: String,
    },
}

impl EngineError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            Self::CycleDetected { .. } => ErrorKind::CycleDetected,
            Self::NotConnected { .. } => ErrorKind::NotConnected,
            Self::UnknownName { .. } => ErrorKind::UnknownName,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::SyscallFailure(_) => ErrorKind::SyscallFailure,
            Self::SanityViolation(_) => ErrorKind::SanityViolation,
            Self::ParameterOutOfSpec { .. } => ErrorKind::ParameterOutOfSpec,
            Self::Plugin { .. } => ErrorKind::Plugin,
        }
    }

    /// Creates a sanity violation error.
    pub fn sanity(message: impl Into<String>) -> Self {
        Self::SanityViolation(message.into())
    }

    /// Creates an unknown-name error.
    pub fn unknown(what: &'static str, name: impl Into<String>) -> Self {
        Self::UnknownName {
            what,
            name: name.into(),
        }
    }

    /// Returns true for validation errors that are reported back to the caller
    /// and never terminate the process.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ShapeMismatch
                | ErrorKind::CycleDetected
                | ErrorKind::NotConnected
                | ErrorKind::UnknownName
                | ErrorKind::ParameterOutOfSpec
        )
    }
}

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(EngineError::sanity("x").kind(), ErrorKind::SanityViolation);
        assert_eq!(
            EngineError::unknown("machine", "m#0:Sine").kind(),
            ErrorKind::UnknownName
        );
        assert_eq!(
            EngineError::ResourceExhausted("queue".into()).kind(),
            ErrorKind::ResourceExhausted
        );
    }

    #[test]
    fn test_display_messages() {
        let err = EngineError::ShapeMismatch {
            output: "Mono".into(),
            input: "Stereo".into(),
            reason: "channel count 1 != 2".into(),
        };
        let text = err.to_string();
        assert!(text.contains("[Mono]"));
        assert!(text.contains("[Stereo]"));

        let err = EngineError::ParameterOutOfSpec {
            name: "bpm",
            value: 500,
        };
        assert_eq!(err.to_string(), "parameter out of spec: bpm = 500");
    }

    #[test]
    fn test_validation_classification() {
        assert!(EngineError::CycleDetected {
            source_machine: "a".into(),
            destination: "b".into(),
        }
        .is_validation());
        assert!(!EngineError::sanity("double registration").is_validation());
        assert!(!EngineError::SyscallFailure("disk".into()).is_validation());
    }

    #[test]
    fn test_errors_are_clone_and_send() {
        fn assert_send<T: Send + Clone>() {}
        assert_send::<EngineError>();
    }
}
