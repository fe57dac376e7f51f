//! Input and output descriptions for machines.
//!
//! Descriptors are the connection points on machines where signals flow in and out.
//! Attach rules are checked against them.

use super::signal::Dimension;

/// Description of a named input on a machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputDescriptor {
    /// Input name, unique within the machine.
    pub name: &'static str,
    /// Dimension the input accepts.
    pub dimension: Dimension,
    /// Channel count the input expects.
    pub channels: usize,
    /// Whether several producers are summed into one buffer before execution.
    /// A premixed input also accepts mono sources regardless of its channel count.
    pub premix: bool,
}

impl InputDescriptor {
    /// Creates an input that hands producers to the plugin unmixed.
    pub fn new(name: &'static str, dimension: Dimension, channels: usize) -> Self {
        Self {
            name,
            dimension,
            channels,
            premix: false,
        }
    }

    /// Creates a premixed input.
    pub fn premixed(name: &'static str, dimension: Dimension, channels: usize) -> Self {
        Self {
            name,
            dimension,
            channels,
            premix: true,
        }
    }

    /// Checks whether a producer of the given shape may attach here.
    ///
    /// Returns a description of the mismatch on failure.
    pub fn accepts(&self, dimension: Dimension, channels: usize) -> Result<(), String> {
        if dimension != self.dimension {
            return Err(format!(
                "dimension {} does not match {}",
                dimension.name(),
                self.dimension.name()
            ));
        }
        if channels != self.channels && !(channels == 1 && self.premix) {
            return Err(format!(
                "channel count {} does not match {}",
                channels, self.channels
            ));
        }
        Ok(())
    }
}

/// Description of a named output on a machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputDescriptor {
    /// Output name, unique within the machine.
    pub name: &'static str,
    /// Dimension of the produced signal.
    pub dimension: Dimension,
    /// Channel count of the produced signal.
    pub channels: usize,
}

impl OutputDescriptor {
    /// Creates an output description.
    pub fn new(name: &'static str, dimension: Dimension, channels: usize) -> Self {
        Self {
            name,
            dimension,
            channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_shape_accepted() {
        let input = InputDescriptor::new("Mono", Dimension::Audio, 1);
        assert!(input.accepts(Dimension::Audio, 1).is_ok());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let input = InputDescriptor::premixed("Stereo", Dimension::Audio, 2);
        let err = input.accepts(Dimension::Midi, 2).unwrap_err();
        assert!(err.contains("dimension"));
    }

    #[test]
    fn test_mono_into_premixed_accepted() {
        let premixed = InputDescriptor::premixed("Stereo", Dimension::Audio, 2);
        assert!(premixed.accepts(Dimension::Audio, 1).is_ok());

        let plain = InputDescriptor::new("Stereo", Dimension::Audio, 2);
        assert!(plain.accepts(Dimension::Audio, 1).is_err());
    }

    #[test]
    fn test_stereo_into_mono_rejected_even_when_premixed() {
        let premixed = InputDescriptor::premixed("Mono", Dimension::Audio, 1);
        assert!(premixed.accepts(Dimension::Audio, 2).is_err());
    }
}
