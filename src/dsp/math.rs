//! Math services offered to plugins: a sine lookup table, a power function
//! and real-valued FFT plans.

use std::sync::Arc;

use parking_lot::Mutex;
use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use super::plugin::PluginError;

/// Entries in the sine table. Must be a power of two.
pub const SINE_TABLE_LEN: usize = 8192;

/// Shared lookup tables and FFT planner.
pub struct MathTables {
    sine: Vec<f32>,
    planner: Mutex<RealFftPlanner<f32>>,
}

impl MathTables {
    pub fn new() -> Self {
        let sine = (0..SINE_TABLE_LEN)
            .map(|i| (2.0 * std::f32::consts::PI * i as f32 / SINE_TABLE_LEN as f32).sin())
            .collect();
        Self {
            sine,
            planner: Mutex::new(RealFftPlanner::new()),
        }
    }

    /// The raw sine table covering one period.
    pub fn sine_table(&self) -> &[f32] {
        &self.sine
    }

    /// Table-based sine of `x` radians.
    pub fn sin(&self, x: f32) -> f32 {
        let pos = (x / (2.0 * std::f32::consts::PI) * SINE_TABLE_LEN as f32) as i64;
        self.sine[(pos & (SINE_TABLE_LEN as i64 - 1)) as usize]
    }

    /// Table-based cosine of `x` radians.
    pub fn cos(&self, x: f32) -> f32 {
        self.sin(x + std::f32::consts::FRAC_PI_2)
    }

    pub fn pow(&self, x: f32, y: f32) -> f32 {
        x.powf(y)
    }

    /// Plans a forward and inverse real FFT of `len` samples.
    ///
    /// Call this from `init` or `prepare`, never from `execute`: planning allocates.
    pub fn prepare_fft(&self, len: usize) -> Result<FftPlan, PluginError> {
        if len < 2 || !len.is_power_of_two() {
            return Err(PluginError::Failed(format!(
                "FFT length {} is not a power of two",
                len
            )));
        }
        let mut planner = self.planner.lock();
        let forward = planner.plan_fft_forward(len);
        let inverse = planner.plan_fft_inverse(len);
        Ok(FftPlan {
            len,
            time_scratch: forward.make_input_vec(),
            freq_scratch: forward.make_output_vec(),
            forward,
            inverse,
        })
    }
}

impl Default for MathTables {
    fn default() -> Self {
        Self::new()
    }
}

/// A prepared real FFT with its own scratch buffers.
pub struct FftPlan {
    len: usize,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    time_scratch: Vec<f32>,
    freq_scratch: Vec<Complex<f32>>,
}

impl FftPlan {
    /// Number of time-domain samples.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of complex bins produced by the forward transform.
    pub fn spectrum_len(&self) -> usize {
        self.len / 2 + 1
    }

    /// Forward transform of `time` (len samples) into `freq` (spectrum_len bins).
    pub fn forward(&mut self, time: &[f32], freq: &mut [Complex<f32>]) -> Result<(), PluginError> {
        if time.len() != self.len || freq.len() != self.spectrum_len() {
            return Err(PluginError::Failed("FFT buffer size mismatch".into()));
        }
        self.time_scratch.copy_from_slice(time);
        self.forward
            .process(&mut self.time_scratch, freq)
            .map_err(|e| PluginError::Failed(e.to_string()))
    }

    /// Inverse transform, normalized so that `inverse(forward(x)) == x`.
    pub fn inverse(&mut self, freq: &[Complex<f32>], time: &mut [f32]) -> Result<(), PluginError> {
        if time.len() != self.len || freq.len() != self.spectrum_len() {
            return Err(PluginError::Failed("FFT buffer size mismatch".into()));
        }
        self.freq_scratch.copy_from_slice(freq);
        // The DC and Nyquist bins of a real signal have no imaginary part.
        self.freq_scratch[0].im = 0.0;
        let last = self.freq_scratch.len() - 1;
        self.freq_scratch[last].im = 0.0;
        self.inverse
            .process(&mut self.freq_scratch, time)
            .map_err(|e| PluginError::Failed(e.to_string()))?;
        let scale = 1.0 / self.len as f32;
        time.iter_mut().for_each(|s| *s *= scale);
        Ok(())
    }
}
