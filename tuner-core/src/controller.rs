//! # Pitch Detection Controller
//!
//! Turns a stream of captured samples into a published pitch result.
//!
//! Samples are appended to an analysis window of `buffer_size` samples. Each
//! time the window fills, the estimator runs once over it, the outcome is
//! checked against the acceptance policy and the result is swapped in as an
//! immutable snapshot. The window then advances by `hop_size` samples: with
//! the default `hop_size == buffer_size` it starts over empty, with a smaller
//! hop the trailing `buffer_size - hop_size` samples are kept.
//!
//! The published snapshot is the only state shared with the display side.
//! Readers obtain it through [`ResultReader`] without ever blocking the
//! processing thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use crate::config::{FALLBACK_SAMPLE_RATE, TunerConfig};
use crate::pitch::{PitchEstimate, PitchEstimator, build_estimator};

/// One published estimation outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchResult {
    pub frequency: f64,
    pub confidence: f64,
    /// False when the window held no acceptable pitch.
    pub valid: bool,
    /// Number of estimations run so far; 0 before the first one.
    pub sequence: u64,
}

impl PitchResult {
    const fn no_signal(sequence: u64) -> Self {
        Self {
            frequency: 0.0,
            confidence: 0.0,
            valid: false,
            sequence,
        }
    }
}

/// A valid result as seen by the display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchReading {
    pub frequency: f64,
    pub confidence: f64,
}

fn reading_of(result: &PitchResult) -> Option<PitchReading> {
    result.valid.then_some(PitchReading {
        frequency: result.frequency,
        confidence: result.confidence,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Nothing buffered since construction, reset or a sample rate change.
    Idle,
    Accumulating,
    Estimating,
}

/// Cheap, cloneable read side of the published result.
#[derive(Clone)]
pub struct ResultReader {
    published: Arc<ArcSwap<PitchResult>>,
}

impl ResultReader {
    /// Latest accepted pitch, or `None` while there is no signal.
    pub fn latest_result(&self) -> Option<PitchReading> {
        reading_of(&self.published.load())
    }

    /// Full snapshot, including invalid results and the sequence number.
    pub fn snapshot(&self) -> PitchResult {
        **self.published.load()
    }
}

pub struct PitchDetectionController {
    estimator: Box<dyn PitchEstimator>,
    window: Vec<f32>,
    buffer_size: usize,
    hop_size: usize,
    confidence_threshold: f64,
    min_frequency: f64,
    max_frequency: f64,
    sample_rate: f64,
    state: ControllerState,
    sequence: u64,
    published: Arc<ArcSwap<PitchResult>>,
}

impl PitchDetectionController {
    /// Builds a controller running the estimator selected in `config`.
    ///
    /// # Arguments
    /// * `config` - Window, hop and acceptance parameters
    /// * `sample_rate` - Rate of the samples that will be fed in; non-positive
    ///   values fall back to 44100 Hz
    pub fn new(config: &TunerConfig, sample_rate: f64) -> Self {
        Self::with_estimator(config, sample_rate, build_estimator(config))
    }

    pub fn with_estimator(config: &TunerConfig, sample_rate: f64, estimator: Box<dyn PitchEstimator>) -> Self {
        let buffer_size = config.buffer_size.max(1);
        let hop_size = config.hop_size.clamp(1, buffer_size);
        let sample_rate = if sample_rate.is_finite() && sample_rate > 0.0 {
            sample_rate
        } else {
            FALLBACK_SAMPLE_RATE
        };

        Self {
            estimator,
            window: Vec::with_capacity(buffer_size),
            buffer_size,
            hop_size,
            confidence_threshold: config.confidence_threshold,
            min_frequency: config.min_frequency,
            max_frequency: config.max_frequency,
            sample_rate,
            state: ControllerState::Idle,
            sequence: 0,
            published: Arc::new(ArcSwap::from_pointee(PitchResult::no_signal(0))),
        }
    }

    /// Appends captured samples, running the estimator for every window
    /// that fills up along the way. An empty slice is a no-op.
    pub fn process_audio(&mut self, samples: &[f32]) {
        let mut remaining = samples;
        while !remaining.is_empty() {
            let room = self.buffer_size - self.window.len();
            let (chunk, rest) = remaining.split_at(room.min(remaining.len()));
            self.window.extend_from_slice(chunk);
            remaining = rest;
            self.state = ControllerState::Accumulating;

            if self.window.len() == self.buffer_size {
                self.state = ControllerState::Estimating;
                let result = self.estimate_window();
                self.published.store(Arc::new(result));
                self.advance_window();
                self.state = ControllerState::Accumulating;
            }
        }
    }

    /// Latest accepted pitch, or `None` while there is no signal.
    pub fn latest_result(&self) -> Option<PitchReading> {
        reading_of(&self.published.load())
    }

    pub fn published_result(&self) -> PitchResult {
        **self.published.load()
    }

    pub fn result_reader(&self) -> ResultReader {
        ResultReader { published: Arc::clone(&self.published) }
    }

    /// Follows a device sample rate change. Buffered samples were captured
    /// at the old rate and are discarded.
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        if !(sample_rate.is_finite() && sample_rate > 0.0) || sample_rate == self.sample_rate {
            return;
        }
        debug!(from = self.sample_rate, to = sample_rate, "controller following new sample rate");
        self.sample_rate = sample_rate;
        self.window.clear();
        self.state = ControllerState::Idle;
    }

    /// Drops buffered samples and publishes "no signal".
    pub fn reset(&mut self) {
        self.window.clear();
        self.state = ControllerState::Idle;
        self.published.store(Arc::new(PitchResult::no_signal(self.sequence)));
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Samples currently waiting in the analysis window.
    pub fn buffered(&self) -> usize {
        self.window.len()
    }

    fn estimate_window(&mut self) -> PitchResult {
        self.sequence += 1;
        let estimator = &mut self.estimator;
        let window = &self.window[..];
        let sample_rate = self.sample_rate;

        match panic::catch_unwind(AssertUnwindSafe(|| estimator.estimate(window, sample_rate))) {
            Ok(Some(estimate)) if self.accepts(&estimate) => PitchResult {
                frequency: estimate.frequency,
                confidence: estimate.confidence,
                valid: true,
                sequence: self.sequence,
            },
            Ok(_) => PitchResult::no_signal(self.sequence),
            Err(_) => {
                warn!(sequence = self.sequence, "pitch estimator panicked, result discarded");
                PitchResult::no_signal(self.sequence)
            }
        }
    }

    fn accepts(&self, estimate: &PitchEstimate) -> bool {
        estimate.frequency.is_finite()
            && estimate.confidence.is_finite()
            && estimate.confidence >= self.confidence_threshold
            && (self.min_frequency..=self.max_frequency).contains(&estimate.frequency)
    }

    fn advance_window(&mut self) {
        if self.hop_size >= self.buffer_size {
            self.window.clear();
        } else {
            self.window.drain(..self.hop_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::TAU;

    use parking_lot::Mutex;

    /// Returns a fixed estimate and records the first sample of every window.
    struct ScriptedEstimator {
        estimate: Option<PitchEstimate>,
        windows: Arc<Mutex<Vec<(usize, f32)>>>,
    }

    impl PitchEstimator for ScriptedEstimator {
        fn estimate(&mut self, window: &[f32], _sample_rate: f64) -> Option<PitchEstimate> {
            self.windows.lock().push((window.len(), window[0]));
            self.estimate
        }
    }

    struct PanickingEstimator;

    impl PitchEstimator for PanickingEstimator {
        fn estimate(&mut self, _window: &[f32], _sample_rate: f64) -> Option<PitchEstimate> {
            panic!("degenerate window");
        }
    }

    fn scripted(
        config: &TunerConfig,
        estimate: Option<PitchEstimate>,
    ) -> (PitchDetectionController, Arc<Mutex<Vec<(usize, f32)>>>) {
        let windows = Arc::new(Mutex::new(Vec::new()));
        let estimator = ScriptedEstimator { estimate, windows: Arc::clone(&windows) };
        (PitchDetectionController::with_estimator(config, 44100.0, Box::new(estimator)), windows)
    }

    fn a4() -> Option<PitchEstimate> {
        Some(PitchEstimate { frequency: 440.0, confidence: 0.95 })
    }

    fn sine(frequency: f64, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (TAU * frequency * i as f64 / 44100.0).sin() as f32)
            .collect()
    }

    #[test]
    fn no_result_before_any_input() {
        let (controller, _) = scripted(&TunerConfig::default(), a4());
        assert_eq!(controller.latest_result(), None);
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.published_result().sequence, 0);
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let (mut controller, windows) = scripted(&TunerConfig::default(), a4());
        controller.process_audio(&[]);
        assert_eq!(controller.state(), ControllerState::Idle);
        assert!(windows.lock().is_empty());
    }

    #[test]
    fn estimates_once_per_full_window() {
        let (mut controller, windows) = scripted(&TunerConfig::default(), a4());
        controller.process_audio(&vec![0.1; 4095]);
        assert_eq!(controller.latest_result(), None);
        assert_eq!(controller.state(), ControllerState::Accumulating);

        controller.process_audio(&[0.1]);
        let reading = controller.latest_result().unwrap();
        assert_eq!(reading.frequency, 440.0);
        assert_eq!(*windows.lock(), vec![(4096usize, 0.1f32)]);
        assert_eq!(controller.buffered(), 0);
    }

    #[test]
    fn one_second_of_audio_yields_ten_results() {
        let (mut controller, windows) = scripted(&TunerConfig::default(), a4());
        for block in vec![0.2f32; 44100].chunks(512) {
            controller.process_audio(block);
        }
        // 44100 / 4096 = 10.77: one result roughly every 93 ms.
        assert_eq!(windows.lock().len(), 10);
        assert_eq!(controller.published_result().sequence, 10);
        assert_eq!(controller.buffered(), 44100 - 10 * 4096);
    }

    #[test]
    fn large_block_fills_several_windows() {
        let (mut controller, windows) = scripted(&TunerConfig::default(), a4());
        controller.process_audio(&vec![0.2; 3 * 4096 + 7]);
        assert_eq!(windows.lock().len(), 3);
        assert_eq!(controller.buffered(), 7);
    }

    #[test]
    fn sliding_hop_keeps_window_tail() {
        let config = TunerConfig { buffer_size: 64, hop_size: 16, ..TunerConfig::default() };
        let (mut controller, windows) = scripted(&config, a4());
        let ramp: Vec<f32> = (0..112).map(|i| i as f32).collect();
        controller.process_audio(&ramp);

        let starts: Vec<f32> = windows.lock().iter().map(|&(_, first)| first).collect();
        assert_eq!(starts, vec![0.0, 16.0, 32.0, 48.0]);
        assert_eq!(controller.buffered(), 48);
    }

    #[test]
    fn low_confidence_is_published_as_invalid() {
        let estimate = Some(PitchEstimate { frequency: 440.0, confidence: 0.5 });
        let (mut controller, _) = scripted(&TunerConfig::default(), estimate);
        controller.process_audio(&vec![0.1; 4096]);
        assert_eq!(controller.latest_result(), None);
        let published = controller.published_result();
        assert!(!published.valid);
        assert_eq!(published.sequence, 1);
    }

    #[test]
    fn out_of_range_frequency_never_becomes_valid() {
        for frequency in [5.0, 12_000.0, f64::NAN, f64::INFINITY] {
            let estimate = Some(PitchEstimate { frequency, confidence: 1.0 });
            let (mut controller, _) = scripted(&TunerConfig::default(), estimate);
            for _ in 0..5 {
                controller.process_audio(&vec![0.1; 4096]);
            }
            assert_eq!(controller.latest_result(), None, "{frequency} Hz");
        }
    }

    #[test]
    fn invalid_result_replaces_previous_valid_one() {
        let config = TunerConfig::default();
        let mut controller = PitchDetectionController::new(&config, 44100.0);
        controller.process_audio(&sine(440.0, 4096));
        assert!(controller.latest_result().is_some());

        controller.process_audio(&vec![0.0; 4096]);
        assert_eq!(controller.latest_result(), None);
    }

    #[test]
    fn estimator_panic_becomes_no_signal() {
        let mut controller =
            PitchDetectionController::with_estimator(&TunerConfig::default(), 44100.0, Box::new(PanickingEstimator));
        controller.process_audio(&vec![0.3; 8192]);
        assert_eq!(controller.latest_result(), None);
        assert_eq!(controller.published_result().sequence, 2);
        assert_eq!(controller.state(), ControllerState::Accumulating);
    }

    #[test]
    fn reader_sees_published_snapshots() {
        let (mut controller, _) = scripted(&TunerConfig::default(), a4());
        let reader = controller.result_reader();
        assert_eq!(reader.latest_result(), None);

        controller.process_audio(&vec![0.1; 4096]);
        let snapshot = reader.snapshot();
        assert!(snapshot.valid);
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(reader.latest_result(), Some(PitchReading { frequency: 440.0, confidence: 0.95 }));

        controller.reset();
        assert_eq!(reader.latest_result(), None);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    /// Every estimate encodes its call index in both fields.
    struct CountingEstimator {
        calls: u64,
    }

    impl PitchEstimator for CountingEstimator {
        fn estimate(&mut self, _window: &[f32], _sample_rate: f64) -> Option<PitchEstimate> {
            self.calls += 1;
            Some(PitchEstimate {
                frequency: 100.0 + self.calls as f64,
                confidence: 0.9 + self.calls as f64 * 1e-6,
            })
        }
    }

    #[test]
    fn concurrent_reader_never_sees_mixed_fields() {
        const WINDOWS: u64 = 2000;
        let config = TunerConfig { buffer_size: 16, hop_size: 16, ..TunerConfig::default() };
        let mut controller =
            PitchDetectionController::with_estimator(&config, 44100.0, Box::new(CountingEstimator { calls: 0 }));
        let reader = controller.result_reader();

        let watcher = std::thread::spawn(move || {
            let mut last_sequence = 0;
            let mut observed = 0;
            while last_sequence < WINDOWS {
                let snapshot = reader.snapshot();
                assert!(snapshot.sequence >= last_sequence);
                if snapshot.valid {
                    let calls = snapshot.frequency - 100.0;
                    assert_eq!(calls, snapshot.sequence as f64);
                    assert_eq!(snapshot.confidence, 0.9 + calls * 1e-6);
                    observed += 1;
                }
                last_sequence = snapshot.sequence;
            }
            observed
        });

        for _ in 0..WINDOWS {
            controller.process_audio(&[0.1; 16]);
        }
        assert!(watcher.join().unwrap() > 0);
        assert_eq!(controller.published_result().sequence, WINDOWS);
    }

    #[test]
    fn sample_rate_change_discards_partial_window() {
        let (mut controller, windows) = scripted(&TunerConfig::default(), a4());
        controller.process_audio(&vec![0.1; 3000]);
        controller.set_sample_rate(48000.0);
        assert_eq!(controller.buffered(), 0);
        assert_eq!(controller.sample_rate(), 48000.0);

        controller.set_sample_rate(0.0);
        assert_eq!(controller.sample_rate(), 48000.0);

        controller.process_audio(&vec![0.1; 3000]);
        assert!(windows.lock().is_empty());
    }

    #[test]
    fn detects_real_tone_end_to_end() {
        let mut controller = PitchDetectionController::new(&TunerConfig::default(), 44100.0);
        controller.process_audio(&sine(196.0, 4096));
        let reading = controller.latest_result().unwrap();
        assert!((reading.frequency - 196.0).abs() < 1.0);
        assert!(reading.confidence >= 0.8);
    }

    #[test]
    fn bad_sample_rate_falls_back() {
        let controller = PitchDetectionController::new(&TunerConfig::default(), -1.0);
        assert_eq!(controller.sample_rate(), 44100.0);
    }
}
