//! # Fast Fourier Transform (FFT) Module
//!
//! Signal conditioning helpers and an FFT-based autocorrelation used by the
//! McLeod estimator.
//!
//! ## Features
//! - High-performance FFT using RustFFT
//! - DC offset removal for accurate analysis
//! - Plans and scratch space allocated once per window size

use std::sync::Arc;

use rustfft::{Fft, FftPlanner, num_complex::Complex};

/// Removes the DC offset from a signal by making its average value zero.
///
/// DC offset can cause issues in frequency analysis by introducing
/// a large component at 0 Hz. This function centers the signal
/// around zero for more accurate frequency analysis.
///
/// # Arguments
/// * `signal` - Audio signal to process (modified in-place)
pub fn remove_dc_offset(signal: &mut [f32]) {
    let len = signal.len();
    if len == 0 { return; }
    let avg = signal.iter().sum::<f32>() / len as f32;
    if avg.abs() > 1e-6 {
        for sample in signal.iter_mut() {
            *sample -= avg;
        }
    }
}

/// Root mean square level of a signal; 0 for an empty slice.
pub fn rms(signal: &[f32]) -> f32 {
    if signal.is_empty() {
        return 0.0;
    }
    (signal.iter().map(|&s| s * s).sum::<f32>() / signal.len() as f32).sqrt()
}

/// Linear (non-circular) autocorrelation through a zero-padded FFT.
///
/// `r[tau] = sum_j x[j] * x[j + tau]` for `tau` in `0..size`.
pub struct Autocorrelator {
    size: usize,
    fft_len: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl Autocorrelator {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        // Padding to at least 2n keeps the circular wrap out of lags < n.
        let fft_len = (2 * size).next_power_of_two();
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        Self {
            size,
            fft_len,
            forward,
            inverse,
            buffer: vec![Complex::default(); fft_len],
            scratch: vec![Complex::default(); scratch_len],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Writes `min(out.len(), size)` autocorrelation lags into `out`.
    /// Signals longer than `size` are truncated, shorter ones zero-padded.
    pub fn process(&mut self, signal: &[f32], out: &mut [f32]) {
        let n = signal.len().min(self.size);
        for (slot, &sample) in self.buffer.iter_mut().zip(&signal[..n]) {
            *slot = Complex { re: sample, im: 0.0 };
        }
        self.buffer[n..].fill(Complex::default());

        self.forward.process_with_scratch(&mut self.buffer, &mut self.scratch);
        for bin in self.buffer.iter_mut() {
            *bin = Complex { re: bin.norm_sqr(), im: 0.0 };
        }
        self.inverse.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let scale = 1.0 / self.fft_len as f32;
        for (lag, bin) in out.iter_mut().zip(&self.buffer[..self.size]) {
            *lag = bin.re * scale;
        }
    }
}
