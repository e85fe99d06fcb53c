//! # Configuration Module
//!
//! Construction-time parameters for the transport and the pitch pipeline.
//! Nothing here is mutable at runtime: a session is built from one
//! `TunerConfig` and keeps it until teardown.
//!
//! ## Layers
//! 1. Built-in defaults (`TunerConfig::default()`)
//! 2. An optional JSON file (`TunerConfig::load`)
//! 3. Overrides kept in a settings store (`TunerConfig::apply_overrides`)

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunerError};
use crate::settings::ConfigStorage;

/// Sample rate reported before any device has started.
pub const FALLBACK_SAMPLE_RATE: f64 = 44100.0;

/// Settings-store keys understood by [`TunerConfig::apply_overrides`].
pub const KEY_CONFIDENCE_THRESHOLD: &str = "confidence_threshold";
pub const KEY_MIN_FREQUENCY: &str = "min_frequency";
pub const KEY_MAX_FREQUENCY: &str = "max_frequency";
pub const KEY_AMPLITUDE_THRESHOLD: &str = "amplitude_threshold";

/// Which pitch estimator the controller runs over each analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatorKind {
    /// Time-domain cumulative mean normalized difference.
    Yin,
    /// Normalized square difference computed through FFT autocorrelation.
    McLeod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Analysis window length in samples.
    pub buffer_size: usize,
    /// Samples the window advances after each estimate. Equal to
    /// `buffer_size` means non-overlapping windows.
    pub hop_size: usize,
    /// Minimum estimator confidence for a result to be published as valid.
    pub confidence_threshold: f64,
    /// Plausible instrument range in Hz.
    pub min_frequency: f64,
    pub max_frequency: f64,
    /// RMS below which a window is treated as silence.
    pub amplitude_threshold: f32,
    /// Ring capacity as a multiple of the device callback block size.
    pub ring_multiple: usize,
    /// Block size assumed when the device does not report one.
    pub nominal_block_size: usize,
    pub estimator: EstimatorKind,
    /// Absolute dip threshold used by the YIN estimator.
    pub yin_threshold: f32,
    /// Display polling cadence.
    pub display_rate_hz: u32,
    /// How often the processing worker drains the capture ring.
    pub poll_interval_ms: u64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            hop_size: 4096,
            confidence_threshold: 0.8,
            min_frequency: 20.0,
            max_frequency: 5000.0,
            amplitude_threshold: 0.01,
            ring_multiple: 32,
            nominal_block_size: 512,
            estimator: EstimatorKind::Yin,
            yin_threshold: 0.15,
            display_rate_hz: 60,
            poll_interval_ms: 10,
        }
    }
}

impl TunerConfig {
    /// Loads a configuration from a JSON file. Missing fields keep their
    /// default values.
    ///
    /// # Arguments
    /// * `path` - JSON file to read (e.g., "tuner.json")
    ///
    /// # Returns
    /// * `Ok(TunerConfig)` - Parsed and validated configuration
    /// * `Err(TunerError)` - I/O, JSON or validation error
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut data = String::new();
        file.read_to_string(&mut data)?;
        let config: TunerConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies any overrides present in a settings store on top of this
    /// configuration and re-validates the result.
    pub fn apply_overrides(mut self, storage: &dyn ConfigStorage) -> Result<Self> {
        if let Some(v) = storage.get_double(KEY_CONFIDENCE_THRESHOLD) {
            self.confidence_threshold = v;
        }
        if let Some(v) = storage.get_double(KEY_MIN_FREQUENCY) {
            self.min_frequency = v;
        }
        if let Some(v) = storage.get_double(KEY_MAX_FREQUENCY) {
            self.max_frequency = v;
        }
        if let Some(v) = storage.get_double(KEY_AMPLITUDE_THRESHOLD) {
            self.amplitude_threshold = v as f32;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < 64 {
            return Err(TunerError::Config(format!(
                "buffer_size must be at least 64 samples, got {}",
                self.buffer_size
            )));
        }
        if self.hop_size == 0 || self.hop_size > self.buffer_size {
            return Err(TunerError::Config(format!(
                "hop_size must be in 1..={}, got {}",
                self.buffer_size, self.hop_size
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(TunerError::Config(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !(self.min_frequency > 0.0 && self.min_frequency < self.max_frequency) {
            return Err(TunerError::Config(format!(
                "frequency range {}..{} Hz is empty or non-positive",
                self.min_frequency, self.max_frequency
            )));
        }
        if self.amplitude_threshold < 0.0 {
            return Err(TunerError::Config("amplitude_threshold must not be negative".into()));
        }
        if self.ring_multiple < 2 || self.nominal_block_size == 0 {
            return Err(TunerError::Config(
                "ring_multiple must be at least 2 and nominal_block_size non-zero".into(),
            ));
        }
        if self.display_rate_hz == 0 || self.poll_interval_ms == 0 {
            return Err(TunerError::Config("display and poll rates must be non-zero".into()));
        }
        Ok(())
    }

    /// Time between two published results under continuous input, in seconds.
    pub fn analysis_period(&self, sample_rate: f64) -> f64 {
        self.hop_size as f64 / sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ConfigStorage, MemoryStorage};
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = TunerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.hop_size, config.buffer_size);
    }

    #[test]
    fn default_analysis_period_is_about_93_ms() {
        let period = TunerConfig::default().analysis_period(44100.0);
        assert!((period - 0.0929).abs() < 0.001);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "buffer_size": 2048, "hop_size": 1024, "estimator": "mcleod" }}"#).unwrap();

        let config = TunerConfig::load(file.path()).unwrap();
        assert_eq!(config.buffer_size, 2048);
        assert_eq!(config.hop_size, 1024);
        assert_eq!(config.estimator, EstimatorKind::McLeod);
        assert_eq!(config.max_frequency, 5000.0);
    }

    #[test]
    fn rejects_hop_larger_than_window() {
        let config = TunerConfig { hop_size: 8192, ..TunerConfig::default() };
        assert!(matches!(config.validate(), Err(TunerError::Config(_))));
    }

    #[test]
    fn rejects_inverted_frequency_range() {
        let config = TunerConfig {
            min_frequency: 800.0,
            max_frequency: 100.0,
            ..TunerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn stored_overrides_win() {
        let mut storage = MemoryStorage::default();
        storage.set_double(KEY_CONFIDENCE_THRESHOLD, 0.5).unwrap();
        storage.set_double(KEY_MAX_FREQUENCY, 2000.0).unwrap();

        let config = TunerConfig::default().apply_overrides(&storage).unwrap();
        assert_eq!(config.confidence_threshold, 0.5);
        assert_eq!(config.max_frequency, 2000.0);
        assert_eq!(config.min_frequency, 20.0);
    }

    #[test]
    fn invalid_stored_override_is_rejected() {
        let mut storage = MemoryStorage::default();
        storage.set_double(KEY_CONFIDENCE_THRESHOLD, 3.0).unwrap();
        assert!(TunerConfig::default().apply_overrides(&storage).is_err());
    }
}
