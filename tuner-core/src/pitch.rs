//! # Pitch Detection Module
//!
//! Pitch estimators the controller runs over each full analysis window.
//! Every estimator satisfies the same contract:
//!
//! - input: one complete window and the sample rate it was captured at
//! - output: `Some(PitchEstimate)` with a confidence in [0, 1], or `None`
//!   when the window holds no usable pitch (silence, noise, too short)
//!
//! Estimators keep their scratch buffers between calls so steady-state
//! analysis does not allocate.
//!
//! ## Estimators
//! - [`YinEstimator`]: time-domain YIN with a noise gate and parabolic
//!   interpolation
//! - [`McLeodEstimator`]: McLeod pitch method (normalized square difference)
//!   over an FFT autocorrelation

use crate::config::{EstimatorKind, TunerConfig};
use crate::fft::{Autocorrelator, remove_dc_offset, rms};

/// Raw output of an estimator, before the controller's acceptance checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchEstimate {
    pub frequency: f64,
    pub confidence: f64,
}

/// A pluggable pitch estimation strategy.
pub trait PitchEstimator: Send {
    fn estimate(&mut self, window: &[f32], sample_rate: f64) -> Option<PitchEstimate>;
}

/// Builds the estimator selected in the configuration.
pub fn build_estimator(config: &TunerConfig) -> Box<dyn PitchEstimator> {
    match config.estimator {
        EstimatorKind::Yin => Box::new(YinEstimator::from_config(config)),
        EstimatorKind::McLeod => Box::new(McLeodEstimator::from_config(config)),
    }
}

/// Refines the position of an extremum at `index` from its two neighbours.
///
/// Returns the fractional offset in [-1, 1] and the interpolated value.
fn parabolic_peak(y1: f32, y2: f32, y3: f32) -> (f32, f32) {
    let denominator = y1 - 2.0 * y2 + y3;
    if denominator.abs() < 1e-12 {
        return (0.0, y2);
    }
    let shift = ((y1 - y3) / (2.0 * denominator)).clamp(-1.0, 1.0);
    (shift, y2 - 0.25 * (y1 - y3) * shift)
}

/// Lag bounds for a frequency range, clamped to `1..=limit`.
fn lag_range(sample_rate: f64, min_frequency: f64, max_frequency: f64, limit: usize) -> Option<(usize, usize)> {
    let min_tau = ((sample_rate / max_frequency).floor() as usize).max(2);
    let max_tau = ((sample_rate / min_frequency).ceil() as usize).min(limit);
    (min_tau < max_tau).then_some((min_tau, max_tau))
}

/// A robust implementation of the YIN pitch detection algorithm.
///
/// - Amplitude gating to filter out silence
/// - Absolute threshold on the cumulative mean normalized difference,
///   taking the first dip to avoid octave errors
/// - Parabolic interpolation for sub-sample accuracy
///
/// Confidence is `1 - d'(tau)` at the chosen lag. When no dip clears the
/// threshold the global minimum is reported with its (low) confidence and
/// the controller rejects it.
pub struct YinEstimator {
    threshold: f32,
    amplitude_threshold: f32,
    min_frequency: f64,
    max_frequency: f64,
    signal: Vec<f32>,
    yin_buffer: Vec<f32>,
}

impl YinEstimator {
    pub fn new(threshold: f32, amplitude_threshold: f32, min_frequency: f64, max_frequency: f64) -> Self {
        Self {
            threshold,
            amplitude_threshold,
            min_frequency,
            max_frequency,
            signal: Vec::new(),
            yin_buffer: Vec::new(),
        }
    }

    pub fn from_config(config: &TunerConfig) -> Self {
        Self::new(
            config.yin_threshold,
            config.amplitude_threshold,
            config.min_frequency,
            config.max_frequency,
        )
    }
}

impl PitchEstimator for YinEstimator {
    fn estimate(&mut self, window: &[f32], sample_rate: f64) -> Option<PitchEstimate> {
        let frame_size = window.len();
        let half = frame_size / 2;
        if half < 4 || !(sample_rate > 0.0) {
            return None;
        }

        self.signal.clear();
        self.signal.extend_from_slice(window);
        remove_dc_offset(&mut self.signal);

        // --- Noise Gate: Calculate RMS to filter out silence/noise ---
        if rms(&self.signal) < self.amplitude_threshold {
            return None;
        }

        // One extra lag past max_tau is computed for interpolation.
        let (min_tau, max_tau) = lag_range(sample_rate, self.min_frequency, self.max_frequency, half - 2)?;
        let signal = &self.signal;
        let yin_buffer = &mut self.yin_buffer;
        yin_buffer.clear();
        yin_buffer.resize(max_tau + 2, 0.0);

        // --- Difference function ---
        for tau in 1..=max_tau + 1 {
            let mut diff = 0.0;
            for i in 0..half {
                let delta = signal[i] - signal[i + tau];
                diff += delta * delta;
            }
            yin_buffer[tau] = diff;
        }

        // --- Cumulative mean normalized difference ---
        let mut running_sum = 0.0;
        yin_buffer[0] = 1.0;
        for tau in 1..=max_tau + 1 {
            running_sum += yin_buffer[tau];
            if running_sum > 0.0 {
                yin_buffer[tau] *= tau as f32 / running_sum;
            } else {
                yin_buffer[tau] = 1.0;
            }
        }

        // --- First dip under the absolute threshold, followed to its bottom ---
        let mut period = None;
        let mut tau = min_tau;
        while tau <= max_tau {
            if yin_buffer[tau] < self.threshold {
                while tau < max_tau && yin_buffer[tau + 1] < yin_buffer[tau] {
                    tau += 1;
                }
                period = Some(tau);
                break;
            }
            tau += 1;
        }
        let period = period.unwrap_or_else(|| {
            (min_tau..=max_tau)
                .min_by(|&a, &b| yin_buffer[a].total_cmp(&yin_buffer[b]))
                .unwrap_or(min_tau)
        });

        // --- Parabolic interpolation for better precision ---
        let (shift, _) = parabolic_peak(yin_buffer[period - 1], yin_buffer[period], yin_buffer[period + 1]);
        let period_float = period as f64 + shift as f64;
        let frequency = sample_rate / period_float;
        let confidence = (1.0 - yin_buffer[period] as f64).clamp(0.0, 1.0);

        (frequency.is_finite() && frequency > 0.0).then_some(PitchEstimate { frequency, confidence })
    }
}

/// McLeod pitch method.
///
/// The normalized square difference `n(tau) = 2 r(tau) / m(tau)` lies in
/// [-1, 1]. Key maxima are the highest points of each positive lobe after the
/// first negative excursion; the first key maximum within `cutoff` of the
/// highest one is the period. Its interpolated height is the confidence.
pub struct McLeodEstimator {
    cutoff: f32,
    amplitude_threshold: f32,
    min_frequency: f64,
    max_frequency: f64,
    autocorrelator: Option<Autocorrelator>,
    signal: Vec<f32>,
    nsdf: Vec<f32>,
    key_maxima: Vec<usize>,
}

impl McLeodEstimator {
    /// Default key-maximum cutoff suggested by McLeod and Wyvill.
    pub const DEFAULT_CUTOFF: f32 = 0.9;

    pub fn new(cutoff: f32, amplitude_threshold: f32, min_frequency: f64, max_frequency: f64) -> Self {
        Self {
            cutoff,
            amplitude_threshold,
            min_frequency,
            max_frequency,
            autocorrelator: None,
            signal: Vec::new(),
            nsdf: Vec::new(),
            key_maxima: Vec::new(),
        }
    }

    pub fn from_config(config: &TunerConfig) -> Self {
        Self::new(
            Self::DEFAULT_CUTOFF,
            config.amplitude_threshold,
            config.min_frequency,
            config.max_frequency,
        )
    }

    fn normalized_square_difference(&mut self) {
        let n = self.signal.len();
        if self.autocorrelator.as_ref().is_none_or(|ac| ac.size() != n) {
            self.autocorrelator = Some(Autocorrelator::new(n));
        }
        let Some(autocorrelator) = self.autocorrelator.as_mut() else {
            return;
        };

        self.nsdf.clear();
        self.nsdf.resize(n, 0.0);
        autocorrelator.process(&self.signal, &mut self.nsdf);

        let x = &self.signal;
        let mut m = 2.0 * self.nsdf[0];
        for tau in 0..n {
            if tau > 0 {
                m -= x[tau - 1] * x[tau - 1] + x[n - tau] * x[n - tau];
            }
            self.nsdf[tau] = if m > 1e-9 { (2.0 * self.nsdf[tau] / m).clamp(-1.0, 1.0) } else { 0.0 };
        }
    }
}

impl PitchEstimator for McLeodEstimator {
    fn estimate(&mut self, window: &[f32], sample_rate: f64) -> Option<PitchEstimate> {
        if window.len() < 8 || !(sample_rate > 0.0) {
            return None;
        }

        self.signal.clear();
        self.signal.extend_from_slice(window);
        remove_dc_offset(&mut self.signal);
        if rms(&self.signal) < self.amplitude_threshold {
            return None;
        }

        let (min_tau, max_tau) =
            lag_range(sample_rate, self.min_frequency, self.max_frequency, window.len() / 2)?;
        self.normalized_square_difference();
        let nsdf = &self.nsdf;

        // Key maxima: one per positive lobe, after the first negative region.
        self.key_maxima.clear();
        let mut tau = 1;
        while tau <= max_tau && nsdf[tau] > 0.0 {
            tau += 1;
        }
        let mut lobe_peak: Option<usize> = None;
        while tau <= max_tau {
            if nsdf[tau] > 0.0 {
                if lobe_peak.is_none_or(|p| nsdf[tau] > nsdf[p]) {
                    lobe_peak = Some(tau);
                }
            } else if let Some(peak) = lobe_peak.take() {
                self.key_maxima.push(peak);
            }
            tau += 1;
        }
        if let Some(peak) = lobe_peak {
            self.key_maxima.push(peak);
        }
        self.key_maxima.retain(|&peak| peak >= min_tau && peak < nsdf.len() - 1);

        let highest = self.key_maxima.iter().map(|&p| nsdf[p]).fold(f32::MIN, f32::max);
        let threshold = self.cutoff * highest;
        let period = *self.key_maxima.iter().find(|&&p| nsdf[p] >= threshold)?;

        let (shift, height) = parabolic_peak(nsdf[period - 1], nsdf[period], nsdf[period + 1]);
        let frequency = sample_rate / (period as f64 + shift as f64);
        let confidence = (height as f64).clamp(0.0, 1.0);

        (frequency.is_finite() && frequency > 0.0).then_some(PitchEstimate { frequency, confidence })
    }
}
